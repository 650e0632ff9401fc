//! Request dispatch.
//!
//! Authenticated payloads carry a schema-tagged envelope; the dispatcher
//! deserialises it, routes to the handler family, and packs the typed
//! result back into the matching response variant. Handler failures are
//! result codes inside the envelope, never transport errors. An envelope
//! naming an operation this build does not know is logged and answered
//! with an empty response variant, so the peer still sees a live frame.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use patrol_core::action::{ActionCommand, ActionQueue, ActionResult};
use patrol_core::ec::manager::{AcpiNamespace, EcManager, EcStats};
use patrol_core::ec::wire::{BatteryHealth, DfuInfo, PeciReadPackage, PeciWritePackage, SmbusCommand};
use patrol_core::ec::EcStatus;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::platform::{
    PlatformError, PlatformOps, PowerAction, RegValue, RegValueType, SystemInfo, WmiRow,
};

/// Handler-level result codes carried in every response variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// The operation ran and succeeded.
    Ok,
    /// The operation ran and failed.
    FailedOp,
    /// The named object does not exist.
    NotFound,
    /// The daemon lacks access to the object.
    AccessDenied,
    /// The request was malformed for this operation.
    InvalidParam,
    /// The operation is not available on this host.
    Unsupported,
}

impl From<&PlatformError> for ResultCode {
    fn from(err: &PlatformError) -> Self {
        match err {
            PlatformError::Unsupported => Self::Unsupported,
            PlatformError::NotFound(_) => Self::NotFound,
            PlatformError::AccessDenied(_) => Self::AccessDenied,
            PlatformError::InvalidParam(_) => Self::InvalidParam,
            PlatformError::Failed(_) => Self::FailedOp,
        }
    }
}

fn code_of<T>(result: &Result<T, PlatformError>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Ok,
        Err(err) => ResultCode::from(err),
    }
}

fn ec_code(status: EcStatus) -> ResultCode {
    if status.is_success() {
        ResultCode::Ok
    } else {
        ResultCode::FailedOp
    }
}

/// Hardware capability summary for the capabilities family.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the EC subsystem is up.
    pub has_ec_control: bool,
    /// Whether battery telemetry is reachable (requires the EC).
    pub has_battery_info: bool,
    /// Whether MSR access is wired on this host.
    pub has_msr_access: bool,
    /// Whether the bezel is currently present.
    pub has_bezel: bool,
}

/// The request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Read a model-specific register.
    MsrRead {
        /// Register address.
        msr: u32,
    },
    /// Write a model-specific register.
    MsrWrite {
        /// Register address.
        msr: u32,
        /// Low 32 bits.
        data_low: u32,
        /// High 32 bits.
        data_high: u32,
    },
    /// Read a registry value.
    RegistryRead {
        /// Key path.
        key_path: String,
        /// Value name.
        value_name: String,
        /// Expected value type.
        value_type: RegValueType,
    },
    /// Write a registry value.
    RegistryWrite {
        /// Key path.
        key_path: String,
        /// Value name.
        value_name: String,
        /// Value to store.
        value: RegValue,
    },
    /// Delete a registry value.
    RegistryDelete {
        /// Key path.
        key_path: String,
        /// Value name.
        value_name: String,
    },
    /// Run a WMI query.
    WmiQuery {
        /// Namespace, defaulted by the handler when empty.
        #[serde(default)]
        namespace_path: String,
        /// The query text.
        query: String,
        /// Optional property projection.
        #[serde(default)]
        property: String,
    },
    /// Delete a file.
    FileDelete {
        /// Target path.
        path: PathBuf,
    },
    /// Rename a file.
    FileRename {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
    },
    /// Copy a file.
    FileCopy {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
    },
    /// Move a file.
    FileMove {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
    },
    /// Hardware capability summary.
    GetCapabilities,
    /// Static machine facts.
    GetSystemInfo,
    /// Raw EC command.
    EcRaw {
        /// Command id.
        command_id: u16,
        /// Outbound payload.
        #[serde(default)]
        payload: Vec<u8>,
        /// Wait bound in milliseconds; the daemon default applies when
        /// absent.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// ACPI namespace read.
    EcAcpiRead {
        /// Namespace id, 0 or 1.
        namespace_id: u32,
        /// Byte offset.
        offset: u32,
        /// Bytes to read.
        size: u32,
    },
    /// ACPI namespace write.
    EcAcpiWrite {
        /// Namespace id, 0 or 1.
        namespace_id: u32,
        /// Byte offset.
        offset: u32,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// EC RAM read.
    EcRamRead {
        /// Byte offset.
        offset: u32,
        /// Bytes to read.
        size: u32,
    },
    /// Firmware image slot layout.
    EcDfuInfo,
    /// Battery health record.
    EcBatteryHealth,
    /// PECI package read.
    EcPeciRead {
        /// PECI host id.
        host_id: u8,
        /// Package register index.
        index: u8,
        /// Low parameter byte.
        param_low: u8,
        /// High parameter byte.
        param_high: u8,
    },
    /// PECI package write.
    EcPeciWrite {
        /// PECI host id.
        host_id: u8,
        /// Package register index.
        index: u8,
        /// Low parameter byte.
        param_low: u8,
        /// High parameter byte.
        param_high: u8,
        /// Value to write.
        data: u32,
    },
    /// Tunnel one SMBus transaction.
    EcSmbus {
        /// Bus select.
        bus: u8,
        /// ACPI SMBus protocol number.
        protocol: u8,
        /// Device address.
        address: u8,
        /// Command byte.
        command: u8,
        /// Transaction data.
        #[serde(default)]
        data: Vec<u8>,
    },
    /// Run a console command on the EC shell.
    EcShell {
        /// Command text.
        command: String,
    },
    /// EC subsystem status and counters.
    EcGetStatus,
    /// Request a power transition.
    Power {
        /// The transition.
        action: PowerAction,
        /// Grace period in seconds.
        #[serde(default)]
        timeout_seconds: u32,
        /// Skip graceful teardown.
        #[serde(default)]
        force: bool,
        /// Operator-visible reason.
        #[serde(default)]
        reason: String,
    },
    /// Queue an action command, optionally waiting for its result.
    ActionQueue {
        /// The command to queue; its id is assigned at enqueue.
        command: ActionCommand,
        /// When set, wait up to this long for the monitor's result.
        #[serde(default)]
        wait_ms: Option<u64>,
    },
    /// Drain every pending action command (monitor clients).
    ActionPoll,
    /// Post the result of an executed action command (monitor clients).
    ActionResult {
        /// The result being posted.
        result: ActionResult,
    },
}

/// The response envelope. Variants mirror [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Response {
    /// MSR read result.
    MsrRead {
        /// Handler result code.
        result: ResultCode,
        /// Low 32 bits.
        data_low: u32,
        /// High 32 bits.
        data_high: u32,
    },
    /// MSR write result.
    MsrWrite {
        /// Handler result code.
        result: ResultCode,
    },
    /// Registry read result.
    RegistryRead {
        /// Handler result code.
        result: ResultCode,
        /// The value when found.
        value: Option<RegValue>,
    },
    /// Registry write result.
    RegistryWrite {
        /// Handler result code.
        result: ResultCode,
    },
    /// Registry delete result.
    RegistryDelete {
        /// Handler result code.
        result: ResultCode,
    },
    /// WMI query result.
    WmiQuery {
        /// Handler result code.
        result: ResultCode,
        /// Result rows.
        rows: Vec<WmiRow>,
    },
    /// File delete result.
    FileDelete {
        /// Handler result code.
        result: ResultCode,
    },
    /// File rename result.
    FileRename {
        /// Handler result code.
        result: ResultCode,
    },
    /// File copy result.
    FileCopy {
        /// Handler result code.
        result: ResultCode,
    },
    /// File move result.
    FileMove {
        /// Handler result code.
        result: ResultCode,
    },
    /// Capability summary.
    GetCapabilities {
        /// Handler result code.
        result: ResultCode,
        /// The capabilities.
        capabilities: Capabilities,
    },
    /// Machine facts.
    GetSystemInfo {
        /// Handler result code.
        result: ResultCode,
        /// The facts.
        info: SystemInfo,
    },
    /// Raw EC command result.
    EcRaw {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
        /// Inbound payload.
        payload: Vec<u8>,
    },
    /// ACPI read result.
    EcAcpiRead {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
        /// Bytes read.
        data: Vec<u8>,
    },
    /// ACPI write result.
    EcAcpiWrite {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
    },
    /// EC RAM read result.
    EcRamRead {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
        /// Bytes read.
        data: Vec<u8>,
    },
    /// Firmware slot layout.
    EcDfuInfo {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
        /// The layout when available.
        info: Option<DfuInfo>,
    },
    /// Battery health record.
    EcBatteryHealth {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
        /// The record when available.
        health: Option<BatteryHealth>,
    },
    /// PECI read result.
    EcPeciRead {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
        /// The package word.
        data: u32,
    },
    /// PECI write result.
    EcPeciWrite {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
    },
    /// SMBus result.
    EcSmbus {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
        /// Protocol echoed by the EC.
        protocol: u8,
        /// Response data.
        data: Vec<u8>,
    },
    /// EC shell result.
    EcShell {
        /// Handler result code.
        result: ResultCode,
        /// EC status.
        ec_status: EcStatus,
    },
    /// EC subsystem status.
    EcGetStatus {
        /// Handler result code.
        result: ResultCode,
        /// Whether the port device opened at startup.
        port_loaded: bool,
        /// Whether the EC worker is running.
        ec_initialized: bool,
        /// The EMI window base.
        emi_base: u16,
        /// Traffic counters.
        stats: EcStats,
    },
    /// Power transition result.
    Power {
        /// Handler result code.
        result: ResultCode,
        /// Failure detail, empty on success.
        error: String,
    },
    /// Action queue result.
    ActionQueue {
        /// Handler result code.
        result: ResultCode,
        /// The assigned command id.
        command_id: u32,
        /// The monitor's result when the caller asked to wait and it
        /// arrived in time.
        outcome: Option<ActionResult>,
    },
    /// Drained action commands.
    ActionPoll {
        /// Handler result code.
        result: ResultCode,
        /// Commands in insertion order.
        commands: Vec<ActionCommand>,
    },
    /// Result-post acknowledgement.
    ActionResult {
        /// Handler result code.
        result: ResultCode,
    },
    /// Liveness reply for unknown operation families.
    Empty,
}

/// Routes authenticated envelopes to their handler family.
pub struct Dispatcher {
    ec: Option<Arc<EcManager>>,
    actions: Arc<ActionQueue>,
    platform: Arc<dyn PlatformOps>,
    ec_timeout: Duration,
    bezel_present: Arc<std::sync::atomic::AtomicBool>,
}

impl Dispatcher {
    /// A dispatcher over the given components. `ec` is `None` when the
    /// daemon runs without the hardware.
    #[must_use]
    pub fn new(
        ec: Option<Arc<EcManager>>,
        actions: Arc<ActionQueue>,
        platform: Arc<dyn PlatformOps>,
        ec_timeout: Duration,
    ) -> Self {
        Self {
            ec,
            actions,
            platform,
            ec_timeout,
            bezel_present: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Shares the bezel-presence flag the poller maintains.
    #[must_use]
    pub fn with_bezel_presence(
        mut self,
        present: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        self.bezel_present = present;
        self
    }

    /// Deserialises `payload`, dispatches, and serialises the response.
    ///
    /// Malformed or unknown envelopes yield the empty liveness variant.
    pub async fn dispatch_bytes(&self, payload: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<Request>(payload) {
            Ok(request) => self.dispatch(request).await,
            Err(err) => {
                warn!(%err, "unknown or malformed request envelope");
                Response::Empty
            }
        };
        serde_json::to_vec(&response).unwrap_or_else(|err| {
            warn!(%err, "failed to encode response envelope");
            Vec::new()
        })
    }

    /// Dispatches one typed request.
    #[allow(clippy::too_many_lines)] // one arm per operation family
    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::MsrRead { msr } => {
                let result = self.platform.msr_read(msr);
                let code = code_of(&result);
                let (data_low, data_high) = result.unwrap_or((0, 0));
                Response::MsrRead {
                    result: code,
                    data_low,
                    data_high,
                }
            }
            Request::MsrWrite {
                msr,
                data_low,
                data_high,
            } => Response::MsrWrite {
                result: code_of(&self.platform.msr_write(msr, data_low, data_high)),
            },
            Request::RegistryRead {
                key_path,
                value_name,
                value_type,
            } => {
                let result = self.platform.registry_read(&key_path, &value_name, value_type);
                Response::RegistryRead {
                    result: code_of(&result),
                    value: result.ok(),
                }
            }
            Request::RegistryWrite {
                key_path,
                value_name,
                value,
            } => Response::RegistryWrite {
                result: code_of(&self.platform.registry_write(&key_path, &value_name, &value)),
            },
            Request::RegistryDelete {
                key_path,
                value_name,
            } => Response::RegistryDelete {
                result: code_of(&self.platform.registry_delete(&key_path, &value_name)),
            },
            Request::WmiQuery {
                namespace_path,
                query,
                property,
            } => {
                let namespace = if namespace_path.is_empty() {
                    "ROOT\\CIMV2"
                } else {
                    &namespace_path
                };
                let result = self.platform.wmi_query(namespace, &query, &property);
                let code = code_of(&result);
                Response::WmiQuery {
                    result: code,
                    rows: result.unwrap_or_default(),
                }
            }
            Request::FileDelete { path } => Response::FileDelete {
                result: code_of(&self.platform.file_delete(&path)),
            },
            Request::FileRename { from, to } => Response::FileRename {
                result: code_of(&self.platform.file_rename(&from, &to)),
            },
            Request::FileCopy { from, to } => Response::FileCopy {
                result: code_of(&self.platform.file_copy(&from, &to)),
            },
            Request::FileMove { from, to } => Response::FileMove {
                result: code_of(&self.platform.file_move(&from, &to)),
            },
            Request::GetCapabilities => {
                let ec_up = self.ec.is_some();
                Response::GetCapabilities {
                    result: ResultCode::Ok,
                    capabilities: Capabilities {
                        has_ec_control: ec_up,
                        has_battery_info: ec_up,
                        has_msr_access: self.platform.msr_read(0).is_ok(),
                        has_bezel: self
                            .bezel_present
                            .load(std::sync::atomic::Ordering::Relaxed),
                    },
                }
            }
            Request::GetSystemInfo => {
                let result = self.platform.system_info();
                let code = code_of(&result);
                Response::GetSystemInfo {
                    result: code,
                    info: result.unwrap_or_default(),
                }
            }
            Request::EcRaw {
                command_id,
                payload,
                timeout_ms,
            } => {
                let timeout = timeout_ms.map_or(self.ec_timeout, Duration::from_millis);
                let (status, data) = self
                    .ec_call(move |ec| ec.send_sync(command_id, &payload, timeout))
                    .await;
                Response::EcRaw {
                    result: ec_code(status),
                    ec_status: status,
                    payload: data,
                }
            }
            Request::EcAcpiRead {
                namespace_id,
                offset,
                size,
            } => {
                let ns = AcpiNamespace::from_id(namespace_id);
                let (status, data) = self.ec_call(move |ec| ec.acpi_read(ns, offset, size)).await;
                Response::EcAcpiRead {
                    result: ec_code(status),
                    ec_status: status,
                    data,
                }
            }
            Request::EcAcpiWrite {
                namespace_id,
                offset,
                data,
            } => {
                let ns = AcpiNamespace::from_id(namespace_id);
                let status = self
                    .ec_call(move |ec| (ec.acpi_write(ns, offset, &data), ()))
                    .await
                    .0;
                Response::EcAcpiWrite {
                    result: ec_code(status),
                    ec_status: status,
                }
            }
            Request::EcRamRead { offset, size } => {
                let (status, data) = self.ec_call(move |ec| ec.ec_ram_read(offset, size)).await;
                Response::EcRamRead {
                    result: ec_code(status),
                    ec_status: status,
                    data,
                }
            }
            Request::EcDfuInfo => {
                let (status, info) = self.ec_call(EcManager::dfu_info).await;
                Response::EcDfuInfo {
                    result: ec_code(status),
                    ec_status: status,
                    info,
                }
            }
            Request::EcBatteryHealth => {
                let (status, health) = self.ec_call(EcManager::battery_health).await;
                Response::EcBatteryHealth {
                    result: ec_code(status),
                    ec_status: status,
                    health,
                }
            }
            Request::EcPeciRead {
                host_id,
                index,
                param_low,
                param_high,
            } => {
                let req = PeciReadPackage {
                    host_id,
                    index,
                    param_low,
                    param_high,
                };
                let (status, data) = self.ec_call(move |ec| ec.peci_read_package(req)).await;
                Response::EcPeciRead {
                    result: ec_code(status),
                    ec_status: status,
                    data: data.unwrap_or(0),
                }
            }
            Request::EcPeciWrite {
                host_id,
                index,
                param_low,
                param_high,
                data,
            } => {
                let req = PeciWritePackage {
                    host_id,
                    index,
                    param_low,
                    param_high,
                    data,
                };
                let status = self
                    .ec_call(move |ec| (ec.peci_write_package(req), ()))
                    .await
                    .0;
                Response::EcPeciWrite {
                    result: ec_code(status),
                    ec_status: status,
                }
            }
            Request::EcSmbus {
                bus,
                protocol,
                address,
                command,
                data,
            } => {
                let req = SmbusCommand::new(bus, protocol, address, command, &data);
                let (status, reply) = self.ec_call(move |ec| ec.smbus_command(req)).await;
                let (protocol, data) = reply
                    .map(|r| (r.protocol, r.valid_data().to_vec()))
                    .unwrap_or_default();
                Response::EcSmbus {
                    result: ec_code(status),
                    ec_status: status,
                    protocol,
                    data,
                }
            }
            Request::EcShell { command } => {
                debug!(command = %command, "EC shell command");
                let status = self
                    .ec_call(move |ec| (ec.shell_command(&command), ()))
                    .await
                    .0;
                Response::EcShell {
                    result: ec_code(status),
                    ec_status: status,
                }
            }
            Request::EcGetStatus => {
                let (port_loaded, ec_initialized, emi_base, stats) = match &self.ec {
                    Some(ec) => (true, ec.is_running(), ec.emi_base(), ec.stats()),
                    None => (false, false, 0, EcStats::default()),
                };
                Response::EcGetStatus {
                    result: ResultCode::Ok,
                    port_loaded,
                    ec_initialized,
                    emi_base,
                    stats,
                }
            }
            Request::Power {
                action,
                timeout_seconds,
                force,
                reason,
            } => {
                let result = self.platform.power(action, timeout_seconds, force, &reason);
                let error = result.as_ref().err().map(ToString::to_string).unwrap_or_default();
                Response::Power {
                    result: code_of(&result),
                    error,
                }
            }
            Request::ActionQueue { command, wait_ms } => {
                let command_id = self.actions.enqueue(command);
                let outcome = match wait_ms {
                    Some(wait_ms) if wait_ms > 0 => {
                        let actions = Arc::clone(&self.actions);
                        tokio::task::spawn_blocking(move || {
                            actions.wait_for_result(command_id, Duration::from_millis(wait_ms))
                        })
                        .await
                        .ok()
                        .flatten()
                    }
                    _ => None,
                };
                Response::ActionQueue {
                    result: ResultCode::Ok,
                    command_id,
                    outcome,
                }
            }
            Request::ActionPoll => Response::ActionPoll {
                result: ResultCode::Ok,
                commands: self.actions.take_pending(),
            },
            Request::ActionResult { result } => {
                self.actions.store_result(result);
                Response::ActionResult {
                    result: ResultCode::Ok,
                }
            }
        }
    }

    /// Runs a blocking EC call on the blocking pool. Without the EC
    /// subsystem every call reports the controller unavailable.
    async fn ec_call<T>(
        &self,
        call: impl FnOnce(&EcManager) -> (EcStatus, T) + Send + 'static,
    ) -> (EcStatus, T)
    where
        T: Default + Send + 'static,
    {
        let Some(ec) = &self.ec else {
            return (EcStatus::Unavailable, T::default());
        };
        let ec = Arc::clone(ec);
        match tokio::task::spawn_blocking(move || call(&ec)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "EC handler task failed");
                (EcStatus::Error, T::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use patrol_core::action::ActionKind;
    use patrol_core::ec::sim::{Firmware, SimulatedEc};
    use patrol_core::ec::transport::EcTransport;
    use patrol_core::ec::PortBus;

    use super::*;
    use crate::platform::HostPlatform;

    fn dispatcher_with_ec(firmware: Firmware) -> Dispatcher {
        let ec = SimulatedEc::new(0x220, firmware);
        let transport = EcTransport::new(ec as Arc<dyn PortBus>, 0x220)
            .with_response_timeout(Duration::from_millis(200));
        Dispatcher::new(
            Some(Arc::new(EcManager::start(transport))),
            Arc::new(ActionQueue::new()),
            Arc::new(HostPlatform),
            Duration::from_millis(5000),
        )
    }

    fn dispatcher_without_ec() -> Dispatcher {
        Dispatcher::new(
            None,
            Arc::new(ActionQueue::new()),
            Arc::new(HostPlatform),
            Duration::from_millis(5000),
        )
    }

    #[tokio::test]
    async fn acpi_read_round_trips_through_the_simulator() {
        let (firmware, registers) = Firmware::acpi_registers();
        registers.lock().unwrap()[0..4].copy_from_slice(&[9, 8, 7, 6]);
        let dispatcher = dispatcher_with_ec(firmware);

        let response = dispatcher
            .dispatch(Request::EcAcpiRead {
                namespace_id: 0,
                offset: 0,
                size: 4,
            })
            .await;

        assert_eq!(
            response,
            Response::EcAcpiRead {
                result: ResultCode::Ok,
                ec_status: EcStatus::Success,
                data: vec![9, 8, 7, 6],
            }
        );
    }

    #[tokio::test]
    async fn ec_requests_without_hardware_report_unavailable() {
        let dispatcher = dispatcher_without_ec();
        let response = dispatcher.dispatch(Request::EcDfuInfo).await;
        assert_eq!(
            response,
            Response::EcDfuInfo {
                result: ResultCode::FailedOp,
                ec_status: EcStatus::Unavailable,
                info: None,
            }
        );
    }

    #[tokio::test]
    async fn unknown_envelope_yields_empty_liveness_variant() {
        let dispatcher = dispatcher_without_ec();
        let bytes = dispatcher
            .dispatch_bytes(br#"{"op":"frobnicate","level":11}"#)
            .await;
        let response: Response = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response, Response::Empty);
    }

    #[tokio::test]
    async fn action_queue_poll_result_rendezvous() {
        let dispatcher = dispatcher_without_ec();

        // Control client queues a command and waits for its result.
        let queue_fut = dispatcher.dispatch(Request::ActionQueue {
            command: ActionCommand {
                command_id: 0,
                event_id: 0x0001_0000,
                kind: ActionKind::TriggerEvent,
            },
            wait_ms: Some(2000),
        });

        // Monitor client polls and answers concurrently.
        let monitor = async {
            loop {
                let response = dispatcher.dispatch(Request::ActionPoll).await;
                let Response::ActionPoll { commands, .. } = response else {
                    panic!("wrong poll variant");
                };
                if let Some(command) = commands.first() {
                    let ack = dispatcher
                        .dispatch(Request::ActionResult {
                            result: ActionResult {
                                command_id: command.command_id,
                                success: true,
                                data: serde_json::json!({"handled": true}),
                            },
                        })
                        .await;
                    assert_eq!(
                        ack,
                        Response::ActionResult {
                            result: ResultCode::Ok
                        }
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        let (queued, ()) = tokio::join!(queue_fut, monitor);
        let Response::ActionQueue {
            result,
            command_id,
            outcome,
        } = queued
        else {
            panic!("wrong queue variant");
        };
        assert_eq!(result, ResultCode::Ok);
        assert_ne!(command_id, 0);
        assert!(outcome.is_some_and(|r| r.success && r.command_id == command_id));
    }

    #[tokio::test]
    async fn file_and_platform_families_answer_typed_codes() {
        let dispatcher = dispatcher_without_ec();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"1").unwrap();

        let response = dispatcher
            .dispatch(Request::FileDelete { path: path.clone() })
            .await;
        assert_eq!(
            response,
            Response::FileDelete {
                result: ResultCode::Ok
            }
        );

        let response = dispatcher.dispatch(Request::FileDelete { path }).await;
        assert_eq!(
            response,
            Response::FileDelete {
                result: ResultCode::NotFound
            }
        );

        let response = dispatcher.dispatch(Request::MsrRead { msr: 0x1A2 }).await;
        assert_eq!(
            response,
            Response::MsrRead {
                result: ResultCode::Unsupported,
                data_low: 0,
                data_high: 0,
            }
        );
    }

    #[tokio::test]
    async fn get_status_reports_counters_and_base() {
        let dispatcher = dispatcher_with_ec(Firmware::echo());

        let _ = dispatcher
            .dispatch(Request::EcRaw {
                command_id: patrol_core::ec::wire::cmd::GET_STATUS,
                payload: vec![],
                timeout_ms: None,
            })
            .await;

        let response = dispatcher.dispatch(Request::EcGetStatus).await;
        let Response::EcGetStatus {
            result,
            port_loaded,
            ec_initialized,
            emi_base,
            stats,
        } = response
        else {
            panic!("wrong variant");
        };
        assert_eq!(result, ResultCode::Ok);
        assert!(port_loaded);
        assert!(ec_initialized);
        assert_eq!(emi_base, 0x220);
        assert_eq!(stats.commands, 1);
    }

    #[tokio::test]
    async fn capabilities_track_bezel_presence() {
        let dispatcher = dispatcher_without_ec();
        dispatcher.bezel_present.store(true, Ordering::Relaxed);

        let response = dispatcher.dispatch(Request::GetCapabilities).await;
        let Response::GetCapabilities { capabilities, .. } = response else {
            panic!("wrong variant");
        };
        assert!(capabilities.has_bezel);
        assert!(!capabilities.has_ec_control);
    }
}
