//! EC command manager.
//!
//! One worker thread owns a FIFO of transactions and drives
//! [`EcTransport`] once per transaction; this is the only serialisation
//! the register window needs. Callers get two contracts:
//!
//! - [`EcManager::send_sync`] suspends the caller on a per-transaction
//!   completion signal. The worker fires the completion hook from its own
//!   context *before* anything else, because a synchronous waiter has no
//!   event loop running to deliver a queued notification — the hook must
//!   wake the waiter directly.
//! - [`EcManager::send_async`] runs the caller's hook on the worker
//!   thread with the final status and inbound payload.
//!
//! A timed-out synchronous caller simply abandons its wait; the worker
//! still owns the transaction and discards its completion. There is no
//! cancellation primitive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::status::EcStatus;
use super::transport::EcTransport;
use super::wire::{
    self, BatteryHealth, DfuInfo, MemRegionRead, PeciReadPackage, PeciWritePackage, SmbusCommand,
};

/// Default timeout for synchronous calls.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(5000);

/// ACPI namespace selector for the read/write helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiNamespace {
    /// Namespace 0, the primary window.
    Ns0,
    /// Namespace 1, the secondary window.
    Ns1,
}

impl AcpiNamespace {
    /// Maps a wire namespace id; anything nonzero selects namespace 1.
    #[must_use]
    pub fn from_id(id: u32) -> Self {
        if id == 0 { Self::Ns0 } else { Self::Ns1 }
    }

    fn read_command(self) -> u16 {
        match self {
            Self::Ns0 => wire::cmd::ACPI0_READ,
            Self::Ns1 => wire::cmd::ACPI1_READ,
        }
    }

    fn write_command(self) -> u16 {
        match self {
            Self::Ns0 => wire::cmd::ACPI0_WRITE,
            Self::Ns1 => wire::cmd::ACPI1_WRITE,
        }
    }
}

/// Completion hook, invoked exactly once from the worker thread.
type CompletionHook = Box<dyn FnOnce(EcStatus, Vec<u8>) + Send>;

/// One queued transaction.
struct EcTransaction {
    packet_id: u32,
    command: u16,
    payload_out: Vec<u8>,
    complete: CompletionHook,
}

/// Worker-shared queue state.
struct QueueState {
    pending: VecDeque<EcTransaction>,
    stopping: bool,
}

/// Traffic and error counters, updated atomically by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct EcStats {
    /// Bytes written to the window.
    pub bytes_tx: u64,
    /// Bytes read back from the window.
    pub bytes_rx: u64,
    /// Transactions attempted.
    pub commands: u64,
    /// Transactions that did not end in success.
    pub errors: u64,
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Condvar,
    packet_id: AtomicU32,
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    commands: AtomicU64,
    errors: AtomicU64,
}

/// Rendezvous cell for one synchronous waiter.
struct SyncCell {
    slot: Mutex<Option<(EcStatus, Vec<u8>)>>,
    done: Condvar,
}

/// The EC command manager. Dropping it stops the worker.
pub struct EcManager {
    shared: Arc<Shared>,
    emi_base: u16,
    worker: Option<JoinHandle<()>>,
}

impl EcManager {
    /// Starts the worker thread over `transport`.
    #[must_use]
    pub fn start(transport: EcTransport) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                stopping: false,
            }),
            wake: Condvar::new(),
            packet_id: AtomicU32::new(1),
            bytes_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
            commands: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        });

        let emi_base = transport.base();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("patrol-ec".into())
            .spawn(move || Self::worker_loop(&worker_shared, &transport))
            .ok();
        if worker.is_none() {
            warn!("failed to spawn EC worker thread");
        }

        Self {
            shared,
            emi_base,
            worker,
        }
    }

    /// The window base the transport drives. Part of the get-status
    /// surface.
    #[must_use]
    pub fn emi_base(&self) -> u16 {
        self.emi_base
    }

    /// Whether the worker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> EcStats {
        EcStats {
            bytes_tx: self.shared.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.shared.bytes_rx.load(Ordering::Relaxed),
            commands: self.shared.commands.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
        }
    }

    fn worker_loop(shared: &Arc<Shared>, transport: &EcTransport) {
        debug!("EC worker started");
        loop {
            let txn = {
                let mut queue = shared
                    .queue
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                loop {
                    if queue.stopping {
                        debug!("EC worker stopping");
                        return;
                    }
                    if let Some(txn) = queue.pending.pop_front() {
                        break txn;
                    }
                    queue = shared
                        .wake
                        .wait(queue)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            };

            let exchange = transport.execute(txn.command, &txn.payload_out);
            shared.bytes_tx.fetch_add(exchange.bytes_tx, Ordering::Relaxed);
            shared.bytes_rx.fetch_add(exchange.bytes_rx, Ordering::Relaxed);
            if exchange.status != EcStatus::Success {
                shared.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    packet_id = txn.packet_id,
                    status = %exchange.status,
                    "EC command {:#06x} failed",
                    txn.command
                );
            }

            // The hook must run from this thread, before any other
            // notification: a blocked synchronous caller is woken by it.
            (txn.complete)(exchange.status, exchange.data);
        }
    }

    /// Next unique, non-zero packet id.
    fn next_packet_id(&self) -> u32 {
        loop {
            let id = self.shared.packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn enqueue(&self, txn: EcTransaction) -> bool {
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if queue.stopping || self.worker.is_none() {
            return false;
        }
        queue.pending.push_back(txn);
        self.shared.commands.fetch_add(1, Ordering::Relaxed);
        self.shared.wake.notify_all();
        true
    }

    /// Sends `command` and waits up to `timeout` for completion.
    ///
    /// The timeout bounds the wait only; the underlying protocol attempt
    /// has its own budget. When the wait expires first the caller gets
    /// [`EcStatus::Timeout`] and the eventual completion is discarded.
    #[must_use]
    pub fn send_sync(
        &self,
        command: u16,
        payload_out: &[u8],
        timeout: Duration,
    ) -> (EcStatus, Vec<u8>) {
        if self.worker.is_none() {
            return (EcStatus::Unavailable, Vec::new());
        }

        let cell = Arc::new(SyncCell {
            slot: Mutex::new(None),
            done: Condvar::new(),
        });
        let hook_cell = Arc::clone(&cell);

        let packet_id = self.next_packet_id();
        let txn = EcTransaction {
            packet_id,
            command,
            payload_out: payload_out.to_vec(),
            complete: Box::new(move |status, data| {
                let mut slot = hook_cell
                    .slot
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                *slot = Some((status, data));
                hook_cell.done.notify_all();
            }),
        };

        if !self.enqueue(txn) {
            return (EcStatus::Unavailable, Vec::new());
        }

        let deadline = Instant::now() + timeout;
        let mut slot = cell
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some((status, data)) = slot.take() {
                // The worker already counted a non-success completion.
                return (status, data);
            }
            let now = Instant::now();
            if now >= deadline {
                // The worker never answered before the deadline; this is
                // a caller-side error the worker cannot see.
                warn!(packet_id, "EC command {command:#06x} wait timed out");
                self.shared.errors.fetch_add(1, Ordering::Relaxed);
                return (EcStatus::Timeout, Vec::new());
            }
            // Bounded slices so a missed wakeup never hangs the caller.
            let slice = (deadline - now).min(Duration::from_millis(100));
            let (next, _timed_out) = cell
                .done
                .wait_timeout(slot, slice)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slot = next;
        }
    }

    /// Queues `command` and returns its packet id, or zero when the
    /// worker is not running.
    ///
    /// `callback` runs on the worker thread once the transaction
    /// completes; anything it borrows must stay alive until then.
    pub fn send_async(
        &self,
        command: u16,
        payload_out: &[u8],
        callback: impl FnOnce(EcStatus, Vec<u8>) + Send + 'static,
    ) -> u32 {
        if self.worker.is_none() {
            return 0;
        }

        let packet_id = self.next_packet_id();
        let txn = EcTransaction {
            packet_id,
            command,
            payload_out: payload_out.to_vec(),
            complete: Box::new(callback),
        };

        if self.enqueue(txn) {
            debug!(packet_id, "queued async EC command {command:#06x}");
            packet_id
        } else {
            0
        }
    }

    /// Stops the worker and joins it. Queued transactions complete with
    /// [`EcStatus::Unavailable`].
    pub fn stop(&mut self) {
        let drained = {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queue.stopping = true;
            self.shared.wake.notify_all();
            std::mem::take(&mut queue.pending)
        };
        for txn in drained {
            (txn.complete)(EcStatus::Unavailable, Vec::new());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("EC worker panicked");
            }
        }
    }

    // ------------------------------------------------------------------
    // Typed convenience calls. All synchronous with the default timeout.
    // ------------------------------------------------------------------

    /// Reads `size` bytes at `offset` from an ACPI namespace window.
    #[must_use]
    pub fn acpi_read(&self, ns: AcpiNamespace, offset: u32, size: u32) -> (EcStatus, Vec<u8>) {
        let req = MemRegionRead {
            start: offset,
            size,
        };
        self.send_sync(ns.read_command(), &req.encode(), DEFAULT_SYNC_TIMEOUT)
    }

    /// Writes `data` at `offset` into an ACPI namespace window.
    #[must_use]
    pub fn acpi_write(&self, ns: AcpiNamespace, offset: u32, data: &[u8]) -> EcStatus {
        let payload = wire::encode_mem_region_write(offset, data);
        self.send_sync(ns.write_command(), &payload, DEFAULT_SYNC_TIMEOUT).0
    }

    /// Reads `size` bytes at `offset` from EC RAM.
    #[must_use]
    pub fn ec_ram_read(&self, offset: u32, size: u32) -> (EcStatus, Vec<u8>) {
        let req = MemRegionRead {
            start: offset,
            size,
        };
        self.send_sync(wire::cmd::ECRAM_READ, &req.encode(), DEFAULT_SYNC_TIMEOUT)
    }

    /// Firmware image slot layout.
    #[must_use]
    pub fn dfu_info(&self) -> (EcStatus, Option<DfuInfo>) {
        let (status, data) = self.send_sync(wire::cmd::DFU_INFO, &[], DEFAULT_SYNC_TIMEOUT);
        if status.is_success() {
            (status, DfuInfo::decode(&data))
        } else {
            (status, None)
        }
    }

    /// Battery health record.
    #[must_use]
    pub fn battery_health(&self) -> (EcStatus, Option<BatteryHealth>) {
        let (status, data) = self.send_sync(wire::cmd::BAT_GET_HEALTH, &[], DEFAULT_SYNC_TIMEOUT);
        if status.is_success() {
            (status, BatteryHealth::decode(&data))
        } else {
            (status, None)
        }
    }

    /// Reads a PECI package register.
    #[must_use]
    pub fn peci_read_package(&self, req: PeciReadPackage) -> (EcStatus, Option<u32>) {
        let (status, data) =
            self.send_sync(wire::cmd::PECI_RD_PKG, &req.encode(), DEFAULT_SYNC_TIMEOUT);
        if status.is_success() {
            (status, PeciReadPackage::decode_response(&data))
        } else {
            (status, None)
        }
    }

    /// Writes a PECI package register.
    #[must_use]
    pub fn peci_write_package(&self, req: PeciWritePackage) -> EcStatus {
        self.send_sync(wire::cmd::PECI_WR_PKG, &req.encode(), DEFAULT_SYNC_TIMEOUT).0
    }

    /// Tunnels one SMBus transaction.
    #[must_use]
    pub fn smbus_command(&self, req: SmbusCommand) -> (EcStatus, Option<SmbusCommand>) {
        let (status, data) =
            self.send_sync(wire::cmd::SMBUS_PROC, &req.encode(), DEFAULT_SYNC_TIMEOUT);
        if status.is_success() {
            (status, SmbusCommand::decode(&data))
        } else {
            (status, None)
        }
    }

    /// Runs a console command on the EC shell.
    #[must_use]
    pub fn shell_command(&self, command: &str) -> EcStatus {
        match wire::encode_shell_command(command) {
            Ok(payload) => {
                self.send_sync(wire::cmd::SHELL_CMD, &payload, DEFAULT_SYNC_TIMEOUT).0
            }
            Err(status) => status,
        }
    }
}

impl Drop for EcManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::ec::port::PortBus;
    use crate::ec::sim::{Firmware, SimulatedEc};
    use crate::ec::transport::EcTransport;

    const BASE: u16 = 0x220;

    fn manager_with(firmware: Firmware) -> EcManager {
        let ec = SimulatedEc::new(BASE, firmware);
        let transport = EcTransport::new(ec as Arc<dyn PortBus>, BASE)
            .with_response_timeout(Duration::from_millis(200));
        EcManager::start(transport)
    }

    #[test]
    fn sync_round_trip_and_stats() {
        let manager = manager_with(Firmware::echo());

        let req = MemRegionRead { start: 0, size: 4 };
        let (status, data) =
            manager.send_sync(wire::cmd::ACPI0_READ, &req.encode(), DEFAULT_SYNC_TIMEOUT);
        assert_eq!(status, EcStatus::Success);
        assert_eq!(data, req.encode());

        let stats = manager.stats();
        assert_eq!(stats.commands, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.bytes_tx, 16);
        assert_eq!(stats.bytes_rx, 16);
    }

    #[test]
    fn packet_ids_are_unique_and_increasing() {
        let manager = manager_with(Firmware::echo());
        let (tx, rx) = mpsc::channel();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let tx = tx.clone();
            let id = manager.send_async(wire::cmd::GET_STATUS, &[], move |status, _| {
                tx.send(status).unwrap();
            });
            assert_ne!(id, 0);
            ids.push(id);
        }

        for _ in 0..5 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                EcStatus::Success
            );
        }

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 5);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn wait_timeout_returns_timeout_and_counts_error() {
        // Short transport budget keeps the worker's retry loop from
        // outliving the test by much after the caller gives up.
        let ec = SimulatedEc::new(BASE, Firmware::never_ready());
        let transport = EcTransport::new(ec as Arc<dyn PortBus>, BASE)
            .with_response_timeout(Duration::from_millis(20));
        let manager = EcManager::start(transport);

        let started = Instant::now();
        let (status, _) =
            manager.send_sync(wire::cmd::GET_STATUS, &[], Duration::from_millis(50));
        assert_eq!(status, EcStatus::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(manager.stats().errors, 1);
    }

    #[test]
    fn async_failure_is_counted_by_the_worker() {
        let manager = manager_with(Firmware::scripted(|_command, _payload| {
            (EcStatus::InvalidCommand, Vec::new())
        }));
        let (tx, rx) = mpsc::channel();

        let id = manager.send_async(wire::cmd::GET_STATUS, &[], move |status, _| {
            tx.send(status).unwrap();
        });
        assert_ne!(id, 0);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            EcStatus::InvalidCommand
        );

        // The worker counts the failure; no synchronous caller exists.
        assert_eq!(manager.stats().errors, 1);
    }

    #[test]
    fn stopped_manager_reports_unavailable() {
        let mut manager = manager_with(Firmware::echo());
        manager.stop();

        let (status, _) = manager.send_sync(wire::cmd::GET_STATUS, &[], DEFAULT_SYNC_TIMEOUT);
        assert_eq!(status, EcStatus::Unavailable);
        assert_eq!(manager.send_async(wire::cmd::GET_STATUS, &[], |_, _| {}), 0);
    }

    #[test]
    fn typed_helpers_decode_responses() {
        let manager = manager_with(Firmware::scripted(|command, _payload| {
            match command {
                wire::cmd::DFU_INFO => {
                    let mut data = vec![2u8, 1, 0, 0];
                    data.extend_from_slice(&0x2_0000u32.to_le_bytes());
                    data.extend_from_slice(&0x8000u32.to_le_bytes());
                    (EcStatus::Success, data)
                }
                wire::cmd::PECI_RD_PKG => {
                    (EcStatus::Success, 0xDEAD_BEEFu32.to_le_bytes().to_vec())
                }
                _ => (EcStatus::InvalidCommand, Vec::new()),
            }
        }));

        let (status, info) = manager.dfu_info();
        assert_eq!(status, EcStatus::Success);
        assert_eq!(info.unwrap().app_slot_size, 0x2_0000);

        let (status, word) = manager.peci_read_package(PeciReadPackage {
            host_id: 0x30,
            index: 2,
            param_low: 0,
            param_high: 0,
        });
        assert_eq!(status, EcStatus::Success);
        assert_eq!(word, Some(0xDEAD_BEEF));

        let (status, _) = manager.acpi_read(AcpiNamespace::Ns0, 0, 1);
        assert_eq!(status, EcStatus::InvalidCommand);
    }

    #[test]
    fn shell_command_overflow_short_circuits() {
        let manager = manager_with(Firmware::echo());
        let long = "y".repeat(200);
        assert_eq!(manager.shell_command(&long), EcStatus::Overflow);
        // Nothing was queued for the oversized command.
        assert_eq!(manager.stats().commands, 0);
    }
}
