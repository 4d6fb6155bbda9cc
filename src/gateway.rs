//! The register access seam between device models and the transport.

use std::future::Future;

/// Register level access to devices on a Modbus bus.
///
/// Every failure (timeouts, refused connections, exception responses, short reads) is reported as
/// `None`. Implementations log the cause; callers treat the outcome as "no data this time".
pub trait Gateway: Send + Sync {
    fn read_holding_registers(
        &self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Option<Vec<u16>>> + Send;

    fn read_input_registers(
        &self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Option<Vec<u16>>> + Send;

    /// Store `value` into a single holding register. `Some(())` once the device acknowledged it.
    fn write_single_register(
        &self,
        device_id: u8,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Option<()>> + Send;
}
