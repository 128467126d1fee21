use tracing::info;

use crate::app::devices::descriptive_name_with_status;
use crate::app::dispatcher::DeviceJob;
use crate::app::error::JobFailure;
use crate::app::models::Device;

/// Lists each selected device with its connection status.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevicesJob;

impl DeviceJob for DevicesJob {
    fn name(&self) -> &str {
        "devices"
    }

    fn do_with_device(&self, device: &Device, trace_id: &str) -> Result<(), JobFailure> {
        info!(
            trace_id = %trace_id,
            serial = %device.serial,
            "Found {}",
            descriptive_name_with_status(device)
        );
        Ok(())
    }
}
