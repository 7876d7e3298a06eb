//! Integration tests for Capyboo firmware.
//!
//! Run after flashing the firmware. Drives the robot's BLE command link
//! and checks the reply lines.

mod ble_client;

use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use ble_client::BleClient;
use tests::{print_results, run_all_tests};

#[derive(Parser)]
#[command(name = "integration-tests")]
#[command(about = "Integration tests for Capyboo firmware")]
struct Args {
    /// Advertised BLE device name
    #[arg(long, default_value = "Capyboo")]
    ble_name: String,

    /// BLE scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("{}", "Capyboo Integration Tests".bold());
    println!("Scanning for \"{}\"...", args.ble_name);

    let device =
        BleClient::connect_by_name(&args.ble_name, Duration::from_secs(args.scan_timeout)).await?;
    println!("{}", "Connected!".green());

    // Skip the welcome line and anything else sent on connect
    tokio::time::sleep(Duration::from_millis(500)).await;
    device.clear_buffer().await;

    println!("\nRunning tests...\n");

    let results = run_all_tests(&device).await;
    print_results(&results);

    device.disconnect().await?;

    // Exit with error code if any tests failed
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
