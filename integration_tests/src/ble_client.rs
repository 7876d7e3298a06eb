//! BLE client for talking to a Capyboo robot over its serial port service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

/// Serial port service UUIDs
const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
const TX_UUID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb); // Notify from device
const RX_UUID: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb); // Write to device

/// BLE client for a Capyboo robot.
pub struct BleClient {
    peripheral: Peripheral,
    rx_char: Characteristic,
    tx_char: Characteristic,
    /// Notification bytes not yet split into lines
    notification_buffer: Arc<Mutex<Vec<u8>>>,
}

impl BleClient {
    /// Scan for a device by name and connect.
    pub async fn connect_by_name(name: &str, scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapters found"))?;

        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await?;

        let peripheral = Self::find_device_by_name(&adapter, name, scan_timeout).await?;

        adapter.stop_scan().await?;

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();

        let rx_char = characteristics
            .iter()
            .find(|c| c.uuid == RX_UUID)
            .cloned()
            .ok_or_else(|| anyhow!("RX characteristic not found"))?;

        let tx_char = characteristics
            .iter()
            .find(|c| c.uuid == TX_UUID)
            .cloned()
            .ok_or_else(|| anyhow!("TX characteristic not found"))?;

        peripheral.subscribe(&tx_char).await?;

        let notification_buffer = Arc::new(Mutex::new(Vec::new()));

        let buffer_clone = notification_buffer.clone();
        let peripheral_clone = peripheral.clone();
        tokio::spawn(async move {
            let mut stream = match peripheral_clone.notifications().await {
                Ok(s) => s,
                Err(_) => return,
            };

            while let Some(data) = stream.next().await {
                if data.uuid == TX_UUID {
                    let mut buf = buffer_clone.lock().await;
                    buf.extend_from_slice(&data.value);
                }
            }
        });

        Ok(Self {
            peripheral,
            rx_char,
            tx_char,
            notification_buffer,
        })
    }

    /// Find a device by name within the scan timeout.
    async fn find_device_by_name(
        adapter: &Adapter,
        name: &str,
        scan_timeout: Duration,
    ) -> Result<Peripheral> {
        let start = std::time::Instant::now();

        while start.elapsed() < scan_timeout {
            for peripheral in adapter.peripherals().await? {
                if let Some(props) = peripheral.properties().await? {
                    if props.local_name.as_deref() == Some(name) {
                        return Ok(peripheral);
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(anyhow!("Device '{}' not found within timeout", name))
    }

    /// Properties the device advertises for its TX characteristic.
    pub fn tx_properties(&self) -> CharPropFlags {
        self.tx_char.properties
    }

    /// Write one packet to the RX characteristic.
    pub async fn write_packet(&self, data: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.rx_char, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    /// Write several packets with a fixed gap between them.
    pub async fn write_packets(&self, packets: &[&[u8]], gap: Duration) -> Result<()> {
        for (i, packet) in packets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(gap).await;
            }
            self.write_packet(packet).await?;
        }
        Ok(())
    }

    /// Send a newline-terminated command and wait for the reply line.
    pub async fn send_command(&self, command: &str, response_timeout: Duration) -> Result<String> {
        self.clear_buffer().await;

        let mut data = command.as_bytes().to_vec();
        data.push(b'\n');
        self.write_packet(&data).await?;

        self.read_line(response_timeout).await
    }

    /// Wait for the next complete line, without its terminator.
    pub async fn read_line(&self, response_timeout: Duration) -> Result<String> {
        let result = timeout(response_timeout, async {
            loop {
                let mut buf = self.notification_buffer.lock().await;

                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    drop(buf);

                    let text = String::from_utf8(line[..pos].to_vec())?;
                    return Ok(text.trim_end_matches('\r').to_string());
                }

                drop(buf);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        match result {
            Ok(line) => line,
            Err(_) => Err(anyhow!("Timeout waiting for reply line")),
        }
    }

    /// Disconnect from the device.
    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.unsubscribe(&self.tx_char).await?;
        self.peripheral.disconnect().await?;
        Ok(())
    }

    /// Clear any pending notifications from the buffer.
    pub async fn clear_buffer(&self) {
        let mut buf = self.notification_buffer.lock().await;
        buf.clear();
    }
}
