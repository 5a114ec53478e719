//! VISA transport.
//!
//! Wraps a session opened through the system VISA library with the `visa-rs`
//! crate. VISA I/O is blocking, so every exchange runs on Tokio's blocking
//! pool. Without the `instrument_visa` feature the transport cannot be opened
//! and the resolver moves on to the next driver source.
//!
//! Supports resource strings like:
//! - "GPIB0::12::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x2636::4123456::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.101::INSTR" (Ethernet/LXI)

use std::time::Duration;

use crate::error::{AppResult, DaqError};

#[cfg(feature = "instrument_visa")]
mod enabled {
    use super::*;
    use crate::instrument::transport::ScpiTransport;
    use async_trait::async_trait;
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Write};
    use std::sync::{Arc, Mutex};
    use tracing::debug;
    use visa_rs::enums::attribute::AttrTmoValue;
    use visa_rs::prelude::*;

    /// SCPI transport over a VISA session.
    ///
    /// The session's own I/O timeout bounds every read and write, so a stalled
    /// instrument releases the blocking thread and the session lock together.
    pub struct VisaTransport {
        instrument: String,
        resource: String,
        timeout: Duration,
        session: Arc<Mutex<Instrument>>,
    }

    impl VisaTransport {
        /// Opens `resource` through the default resource manager.
        ///
        /// A missing VISA library or an unknown resource is
        /// [`DaqError::DriverUnavailable`] so the resolver can fall back to
        /// the next driver source. Failures after the resource was found are
        /// communication errors.
        pub async fn open(instrument: &str, resource: &str, timeout: Duration) -> AppResult<Self> {
            let name = instrument.to_string();
            let resource_owned = resource.to_string();
            let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

            let session = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new().map_err(|e| {
                    DaqError::DriverUnavailable(format!("VISA resource manager: {}", e))
                })?;
                let expr = CString::new(resource_owned.clone())
                    .map_err(|e| {
                        DaqError::Configuration(format!("invalid resource string: {}", e))
                    })?
                    .into();
                let rsc = rm.find_res(&expr).map_err(|e| {
                    DaqError::DriverUnavailable(format!(
                        "VISA resource {} not found: {}",
                        resource_owned, e
                    ))
                })?;
                let session = rm
                    .open(&rsc, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                    .map_err(|e| DaqError::communication(&name, format!("open {}: {}", resource_owned, e)))?;
                let tmo = AttrTmoValue::new_checked(timeout_ms).ok_or_else(|| {
                    DaqError::Configuration(format!("VISA timeout {}ms out of range", timeout_ms))
                })?;
                session
                    .set_attr(tmo)
                    .map_err(|e| DaqError::communication(&name, format!("set timeout: {}", e)))?;
                Ok::<_, DaqError>(session)
            })
            .await
            .map_err(|e| DaqError::communication(instrument, format!("VISA open task: {}", e)))??;

            debug!(instrument, resource, timeout_ms, "VISA session opened");

            Ok(Self {
                instrument: instrument.to_string(),
                resource: resource.to_string(),
                timeout,
                session: Arc::new(Mutex::new(session)),
            })
        }

        async fn exchange(&self, command: &str, expect_response: bool) -> AppResult<String> {
            let session = self.session.clone();
            let line = format!("{}\n", command);
            tokio::task::spawn_blocking(move || {
                let guard = session
                    .lock()
                    .map_err(|_| "VISA session lock poisoned".to_string())?;
                let instr: &Instrument = &guard;
                let mut writer = instr;
                writer
                    .write_all(line.as_bytes())
                    .map_err(|e| format!("write: {}", e))?;
                if !expect_response {
                    return Ok(String::new());
                }
                let mut reader = BufReader::new(instr);
                let mut response = String::new();
                reader
                    .read_line(&mut response)
                    .map_err(|e| format!("read: {}", e))?;
                Ok::<_, String>(response.trim().to_string())
            })
            .await
            .map_err(|e| DaqError::communication(&self.instrument, format!("VISA task: {}", e)))?
            .map_err(|e| DaqError::communication(&self.instrument, format!("'{}' {}", command, e)))
        }
    }

    #[async_trait]
    impl ScpiTransport for VisaTransport {
        async fn write(&self, command: &str) -> AppResult<()> {
            self.exchange(command, false).await.map(|_| ())
        }

        async fn query(&self, command: &str) -> AppResult<String> {
            self.exchange(command, true).await
        }

        fn describe(&self) -> String {
            format!("visa {} ({}ms timeout)", self.resource, self.timeout.as_millis())
        }
    }
}

#[cfg(feature = "instrument_visa")]
pub use enabled::VisaTransport;

/// True when this build can open VISA sessions.
pub fn visa_available() -> bool {
    cfg!(feature = "instrument_visa")
}

/// Opens a VISA-backed SCPI transport.
///
/// Returns [`DaqError::DriverUnavailable`] in builds without the
/// `instrument_visa` feature.
pub async fn open_transport(
    instrument: &str,
    resource: &str,
    timeout: Duration,
) -> AppResult<Box<dyn super::transport::ScpiTransport>> {
    #[cfg(feature = "instrument_visa")]
    {
        let transport = VisaTransport::open(instrument, resource, timeout).await?;
        Ok(Box::new(transport))
    }

    #[cfg(not(feature = "instrument_visa"))]
    {
        let _ = (instrument, resource, timeout);
        Err(DaqError::DriverUnavailable(
            "VISA support not enabled. Rebuild with --features instrument_visa".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn visa_is_unavailable_without_feature() {
        assert!(!visa_available());
        let result = open_transport("k2182a", "GPIB0::7::INSTR", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DaqError::DriverUnavailable(_))));
    }

    #[cfg(feature = "instrument_visa")]
    #[tokio::test]
    async fn unknown_resource_falls_back() {
        // Either the VISA library is missing or the resource does not exist;
        // both let the resolver try the next source.
        let result = open_transport("k2182a", "GPIB7::29::INSTR", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(DaqError::DriverUnavailable(_))));
    }
}
