//! Persistent network settings and slave power control.

use crate::constants::{CONTROL_IN_MAX_LENGTH, ConfigSelector, VendorRequest};
use crate::device_info::decode_c_string;
use crate::error::{McmError, Result};
use crate::session::Session;
use crate::transport::UsbTransport;
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::info;

/// Network state of the MCM's Wi-Fi interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpInfo {
    pub link_up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

impl IpInfo {
    /// Parse the reply: empty when the link is down, otherwise three LE words.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(IpInfo {
                link_up: false,
                ip: None,
                netmask: None,
                gateway: None,
            });
        }
        if data.len() < 12 {
            return Err(McmError::InvalidResponse(format!(
                "IP info needs 12 bytes, got {}",
                data.len()
            )));
        }
        let word = |at: usize| -> Result<Ipv4Addr> {
            let octets: [u8; 4] = data[at..at + 4].try_into()?;
            Ok(Ipv4Addr::from(octets))
        };
        Ok(IpInfo {
            link_up: true,
            ip: Some(word(0)?),
            netmask: Some(word(4)?),
            gateway: Some(word(8)?),
        })
    }
}

/// Render a MAC address as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

impl<T: UsbTransport> Session<T> {
    async fn set_config_string(&mut self, selector: ConfigSelector, value: &str) -> Result<()> {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.vendor_control_transfer_out(VendorRequest::Config, selector.into(), payload)
            .await?;
        info!("Stored {:?}", selector);
        Ok(())
    }

    async fn get_config_string(&mut self, selector: ConfigSelector) -> Result<String> {
        let data = self
            .vendor_control_transfer_in(VendorRequest::Config, selector.into(), CONTROL_IN_MAX_LENGTH)
            .await?;
        Ok(decode_c_string(&data))
    }

    pub async fn hostname(&mut self) -> Result<String> {
        self.get_config_string(ConfigSelector::Hostname).await
    }

    pub async fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        self.set_config_string(ConfigSelector::Hostname, hostname).await
    }

    pub async fn wifi_ssid(&mut self) -> Result<String> {
        self.get_config_string(ConfigSelector::WifiSsid).await
    }

    pub async fn set_wifi_ssid(&mut self, ssid: &str) -> Result<()> {
        self.set_config_string(ConfigSelector::WifiSsid, ssid).await
    }

    pub async fn wifi_password(&mut self) -> Result<String> {
        self.get_config_string(ConfigSelector::WifiPassword).await
    }

    pub async fn set_wifi_password(&mut self, password: &str) -> Result<()> {
        self.set_config_string(ConfigSelector::WifiPassword, password).await
    }

    pub async fn wifi_mac(&mut self) -> Result<[u8; 6]> {
        let data = self
            .vendor_control_transfer_in(VendorRequest::Config, ConfigSelector::WifiMac.into(), CONTROL_IN_MAX_LENGTH)
            .await?;
        let mac = data
            .get(..6)
            .ok_or_else(|| McmError::InvalidResponse(format!("MAC needs 6 bytes, got {}", data.len())))?;
        Ok(mac.try_into()?)
    }

    pub async fn ip_info(&mut self) -> Result<IpInfo> {
        let data = self
            .vendor_control_transfer_in(
                VendorRequest::Config,
                ConfigSelector::WifiIpInfo.into(),
                CONTROL_IN_MAX_LENGTH,
            )
            .await?;
        IpInfo::parse(&data)
    }

    /// Power the attached slave from the MCM.
    pub async fn enable_slave_power(&mut self) -> Result<()> {
        self.vendor_command(VendorRequest::SlaveCtrl, 1).await
    }

    pub async fn disable_slave_power(&mut self) -> Result<()> {
        self.vendor_command(VendorRequest::SlaveCtrl, 0).await
    }

    pub async fn is_slave_power_enabled(&mut self) -> Result<bool> {
        let data = self
            .vendor_control_transfer_in(VendorRequest::SlaveCtrl, 0, CONTROL_IN_MAX_LENGTH)
            .await?;
        Ok(data.first() == Some(&1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_info_link_down() {
        let info = IpInfo::parse(&[]).unwrap();
        assert!(!info.link_up);
        assert_eq!(info.ip, None);
        assert_eq!(serde_json::to_string(&info).unwrap(), r#"{"link_up":false}"#);
    }

    #[test]
    fn ip_info_words_are_little_endian() {
        let data = [192, 168, 4, 1, 255, 255, 255, 0, 192, 168, 4, 254];
        let info = IpInfo::parse(&data).unwrap();
        assert!(info.link_up);
        assert_eq!(info.ip, Some(Ipv4Addr::new(192, 168, 4, 1)));
        assert_eq!(info.netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(info.gateway, Some(Ipv4Addr::new(192, 168, 4, 254)));
    }

    #[test]
    fn ip_info_short_reply() {
        assert!(matches!(IpInfo::parse(&[1, 2, 3]), Err(McmError::InvalidResponse(_))));
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(format_mac(&[0x24, 0x0A, 0xC4, 0x00, 0xFF, 0x1B]), "24:0a:c4:00:ff:1b");
    }
}
