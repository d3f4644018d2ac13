//! Host Wi-Fi through NetworkManager's `nmcli`

use goodsleep_commission::{NetworkError, NetworkService, WifiInfo};
use tokio::process::Command;

pub struct NmcliNetwork;

async fn nmcli(args: &[&str]) -> Result<String, NetworkError> {
    let output = Command::new("nmcli")
        .args(args)
        .output()
        .await
        .map_err(|e| NetworkError::Transport(format!("failed to run nmcli: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Transport(format!(
            "nmcli failed with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Split one line of `nmcli -t` output; `\:` and `\\` are escapes
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    if let Some(field) = fields.last_mut() {
                        field.push(next);
                    }
                }
            }
            ':' => fields.push(String::new()),
            c => {
                if let Some(field) = fields.last_mut() {
                    field.push(c);
                }
            }
        }
    }
    fields
}

/// `2437 MHz` -> 2437
fn parse_frequency(s: &str) -> Option<u32> {
    s.split_whitespace().next()?.parse().ok()
}

/// nmcli reports signal quality 0-100; map it onto dBm the usual way
fn quality_to_dbm(s: &str) -> Option<i16> {
    let quality: i16 = s.trim().parse().ok()?;
    Some(quality.clamp(0, 100) / 2 - 100)
}

/// Parse `SSID:FREQ:SIGNAL` lines
fn parse_networks(out: &str) -> Vec<WifiInfo> {
    out.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let f = split_terse(line);
            if f.len() < 3 {
                return None;
            }
            Some(WifiInfo {
                ssid: f[0].clone(),
                frequency_mhz: parse_frequency(&f[1]),
                rssi: quality_to_dbm(&f[2]),
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl NetworkService for NmcliNetwork {
    async fn enable(&self) -> Result<(), NetworkError> {
        let out = nmcli(&["-t", "-f", "WIFI", "radio"]).await?;
        match out.trim() {
            "enabled" => Ok(()),
            "disabled" => Err(NetworkError::Disabled),
            other => Err(NetworkError::Transport(format!("unexpected radio state {other:?}"))),
        }
    }

    async fn current_network(&self) -> Result<Option<WifiInfo>, NetworkError> {
        let out = nmcli(&["-t", "-f", "ACTIVE,SSID,FREQ,SIGNAL", "device", "wifi", "list", "--rescan", "no"]).await?;
        for line in out.lines() {
            let f = split_terse(line);
            if f.len() >= 4 && f[0] == "yes" {
                return Ok(Some(WifiInfo {
                    ssid: f[1].clone(),
                    frequency_mhz: parse_frequency(&f[2]),
                    rssi: quality_to_dbm(&f[3]),
                }));
            }
        }
        Ok(None)
    }

    async fn scan_networks(&self) -> Result<Vec<WifiInfo>, NetworkError> {
        let out = nmcli(&["-t", "-f", "SSID,FREQ,SIGNAL", "device", "wifi", "list", "--rescan", "yes"]).await?;
        Ok(parse_networks(&out))
    }
}
