//! `lbard service` — systemd integration.
//!
//! Installs and manages a systemd unit that runs `lbard run` in the
//! background under the configured user, restarting it if the process
//! dies (a stalled radio driver or a lost HTTP connection are not fatal,
//! per the design's "keep running, try again next tick" philosophy, but a
//! hard crash still shouldn't take the node offline for good).

use anyhow::Result;
use std::process::Command;

const UNIT_PATH: &str = "/etc/systemd/system/lbard.service";
const UNIT_NAME: &str = "lbard";

pub fn install(config_path: &std::path::Path) -> Result<()> {
    let already_active = Command::new("systemctl")
        .args(["is-active", "--quiet", UNIT_NAME])
        .status()
        .map(|s| s.success())
        .unwrap_or(false);

    if already_active {
        println!("Service is already running.");
        println!();
        println!("  lbard service stop     — stop the service");
        println!("  lbard service restart  — restart the service");
        println!("  lbard status           — view recent activity");
        return Ok(());
    }

    let binary = std::env::current_exe()?;
    let config_abs = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.to_path_buf());

    let unit = format!(
        r#"[Unit]
Description=LBARD — Rhizome low-bandwidth sync
After=network.target

[Service]
Type=simple
User=root
ExecStart={binary} -c {config} run
Restart=always
RestartSec=5
StandardOutput=journal
StandardError=journal

[Install]
WantedBy=multi-user.target
"#,
        binary = binary.display(),
        config = config_abs.display(),
    );

    std::fs::write(UNIT_PATH, unit)?;

    let _ = Command::new("systemctl").arg("daemon-reload").status();
    let _ = Command::new("systemctl").args(["enable", UNIT_NAME]).status();
    let _ = Command::new("systemctl").args(["start", UNIT_NAME]).status();

    println!("Service installed, enabled, and started.");
    println!();
    println!("  lbard status  — view recent activity");

    Ok(())
}

pub fn uninstall() -> Result<()> {
    let _ = Command::new("systemctl").args(["stop", UNIT_NAME]).status();
    let _ = Command::new("systemctl").args(["disable", UNIT_NAME]).status();
    if std::path::Path::new(UNIT_PATH).exists() {
        std::fs::remove_file(UNIT_PATH)?;
    }
    let _ = Command::new("systemctl").arg("daemon-reload").status();
    println!("Removed {}.", UNIT_PATH);
    Ok(())
}

pub fn control(action: &str) -> Result<()> {
    let ok = Command::new("systemctl")
        .args([action, UNIT_NAME])
        .status()?
        .success();
    anyhow::ensure!(ok, "systemctl {} {} failed", action, UNIT_NAME);
    Ok(())
}
