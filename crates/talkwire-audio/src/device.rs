use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};
use talkwire_foundation::AudioError;

pub struct DeviceManager {
    host: Host,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
}

impl DeviceManager {
    pub fn new() -> Result<Self, AudioError> {
        Ok(Self {
            host: cpal::default_host(),
        })
    }

    pub fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        if let Ok(inputs) = self.host.input_devices() {
            for device in inputs {
                if let Ok(name) = device.name() {
                    devices.push(DeviceInfo {
                        name,
                        is_default: false,
                    });
                }
            }
        }

        if let Some(default_name) = self.default_input_device_name() {
            for device in &mut devices {
                if device.name == default_name {
                    device.is_default = true;
                }
            }
        }

        devices
    }

    pub fn default_input_device_name(&self) -> Option<String> {
        self.host.default_input_device().and_then(|d| d.name().ok())
    }

    /// Open the named input device, or the host default when no name is
    /// given. Name matching tries exact first, then case-insensitive
    /// substring, so `--device usb` finds "USB Audio Device".
    pub fn open_device(&self, name: Option<&str>) -> Result<Device, AudioError> {
        match name {
            Some(wanted) => {
                let devices: Vec<Device> = self.host.input_devices()?.collect();
                if let Some(device) = devices
                    .iter()
                    .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                {
                    return Ok(device.clone());
                }
                let wanted_lower = wanted.to_lowercase();
                if let Some(device) = devices.iter().find(|d| {
                    d.name()
                        .map(|n| n.to_lowercase().contains(&wanted_lower))
                        .unwrap_or(false)
                }) {
                    tracing::info!("Input device matched by substring: {:?}", device.name());
                    return Ok(device.clone());
                }
                Err(AudioError::DeviceNotFound {
                    name: Some(wanted.to_string()),
                })
            }
            None => self
                .host
                .default_input_device()
                .ok_or(AudioError::DeviceNotFound { name: None }),
        }
    }
}
