use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rusb::{DeviceHandle, GlobalContext, Recipient, RequestType, UsbContext};

use crate::errors::{DriverError, Result, TransportError};

/// Analog Devices evaluation board (FX2 bridge running the AD5933 firmware).
pub const DEFAULT_VID: u16 = 0x0456;
pub const DEFAULT_PID: u16 = 0xB203;

/// Vendor request the bridge firmware answers for register access.
pub const REGISTER_REQUEST: u8 = 0xDE;
/// Fixed `wValue` of every register request.
pub const REGISTER_VALUE: u16 = 0x0D;

const DEFAULT_INTERFACE: u8 = 0;
const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 1000;
const MAX_OPEN_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Direction of a control transfer, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Vendor control-transfer channel to the device.
///
/// `buf` is filled for [`Direction::In`] and sent for [`Direction::Out`].
/// Returns the number of bytes moved in the data stage.
pub trait ControlTransport {
    fn control_transfer(
        &mut self,
        direction: Direction,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> std::result::Result<usize, TransportError>;
}

impl<T: ControlTransport + ?Sized> ControlTransport for Box<T> {
    fn control_transfer(
        &mut self,
        direction: Direction,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> std::result::Result<usize, TransportError> {
        (**self).control_transfer(direction, request, value, index, buf)
    }
}

/// Opens and claims the evaluation board.
///
/// The FX2 must already be running the AD5933 application firmware.
#[derive(Debug, Clone)]
pub struct UsbConnector {
    pub vid: u16,
    pub pid: u16,
    pub interface: u8,
    pub transfer_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for UsbConnector {
    fn default() -> Self {
        Self {
            vid: DEFAULT_VID,
            pid: DEFAULT_PID,
            interface: DEFAULT_INTERFACE,
            transfer_timeout: Duration::from_millis(DEFAULT_TRANSFER_TIMEOUT_MS),
            max_retries: MAX_OPEN_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl UsbConnector {
    /// Find the single matching device and claim its interface.
    ///
    /// Retries with exponential backoff; a missing device or a second matching
    /// device is reported immediately.
    pub fn open(&self) -> Result<UsbTransport> {
        let mut last_error = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying USB open after {:?} ({:04x}:{:04x}, attempt={})",
                    delay, self.vid, self.pid, attempt
                );
                thread::sleep(delay);
            }

            match self.try_open() {
                Ok(transport) => {
                    info!(
                        "claimed interface {} on {:04x}:{:04x}",
                        self.interface, self.vid, self.pid
                    );
                    return Ok(transport);
                }
                Err(e @ DriverError::NotFound { .. })
                | Err(e @ DriverError::Usb(TransportError::Ambiguous { .. })) => return Err(e),
                Err(e) => {
                    warn!(
                        "USB open attempt failed: {:04x}:{:04x}, attempt={}, error={}",
                        self.vid, self.pid, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(DriverError::NotFound {
            vid: self.vid,
            pid: self.pid,
        }))
    }

    fn try_open(&self) -> Result<UsbTransport> {
        let devices = GlobalContext::default()
            .devices()
            .map_err(TransportError::from)?;

        let mut matching = devices.iter().filter(|device| {
            device
                .device_descriptor()
                .map(|d| d.vendor_id() == self.vid && d.product_id() == self.pid)
                .unwrap_or(false)
        });

        let device = matching.next().ok_or(DriverError::NotFound {
            vid: self.vid,
            pid: self.pid,
        })?;
        if matching.next().is_some() {
            return Err(TransportError::Ambiguous {
                vid: self.vid,
                pid: self.pid,
            }
            .into());
        }

        debug!(
            "opening bus {} address {}",
            device.bus_number(),
            device.address()
        );
        let mut handle = device.open().map_err(TransportError::from)?;

        // Not every platform can query this; treat "unsupported" as inactive.
        if handle.kernel_driver_active(self.interface).unwrap_or(false) {
            return Err(TransportError::KernelDriverActive(self.interface).into());
        }
        handle
            .claim_interface(self.interface)
            .map_err(TransportError::from)?;

        Ok(UsbTransport {
            handle,
            interface: self.interface,
            timeout: self.transfer_timeout,
        })
    }
}

/// Claimed USB handle that issues vendor control transfers.
pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    timeout: Duration,
}

impl ControlTransport for UsbTransport {
    fn control_transfer(
        &mut self,
        direction: Direction,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> std::result::Result<usize, TransportError> {
        let result = match direction {
            Direction::In => self.handle.read_control(
                rusb::request_type(rusb::Direction::In, RequestType::Vendor, Recipient::Device),
                request,
                value,
                index,
                buf,
                self.timeout,
            ),
            Direction::Out => self.handle.write_control(
                rusb::request_type(rusb::Direction::Out, RequestType::Vendor, Recipient::Device),
                request,
                value,
                index,
                buf,
                self.timeout,
            ),
        };

        result.map_err(|e| match e {
            rusb::Error::NoDevice => TransportError::Disconnected,
            other => TransportError::Usb(other),
        })
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("release_interface({}) failed: {}", self.interface, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_defaults_target_eval_board() {
        let c = UsbConnector::default();
        assert_eq!((c.vid, c.pid), (0x0456, 0xB203));
        assert_eq!(c.interface, 0);
        assert_eq!(c.max_retries, 3);
    }

    #[test]
    fn vendor_request_types() {
        assert_eq!(
            rusb::request_type(rusb::Direction::In, RequestType::Vendor, Recipient::Device),
            0xC0
        );
        assert_eq!(
            rusb::request_type(rusb::Direction::Out, RequestType::Vendor, Recipient::Device),
            0x40
        );
    }
}
