//! C9 (ambient) — external CAN-stack collaborator.
//!
//! Bringing interfaces up/down and setting bitrates is explicitly out of
//! scope for the core (spec §1); only the *shape* of this collaborator is
//! specified (§6). This module exists so the facade's
//! `get_interface_states()` and `INTERFACE_STATE_CHANGED` event have a
//! real, if minimal, producer — grounded on
//! `original_source/core/interface_manager.py` and `lib/canif.py`'s
//! `ip link` shell-out pattern, the same `std::process::Command` idiom
//! the teacher's `service.rs` uses for `systemctl`.

use std::io;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceState {
    pub name: String,
    pub state: LinkState,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

pub trait InterfaceController: Send + Sync {
    fn bring_up(&self, iface: &str, bitrate: u32) -> io::Result<()>;
    fn bring_down(&self, iface: &str) -> io::Result<()>;
    fn state(&self, iface: &str) -> io::Result<InterfaceState>;
}

/// Shells out to `ip link`, same as the source's `canif.py`. Virtual
/// interfaces (`vcan*`) ignore the bitrate argument, matching the
/// source's behavior, since vcan has no physical bit timing to program.
pub struct ShellInterfaceController;

impl InterfaceController for ShellInterfaceController {
    fn bring_up(&self, iface: &str, bitrate: u32) -> io::Result<()> {
        if iface.starts_with("vcan") {
            run(Command::new("ip").args(["link", "set", iface, "up"]))
        } else {
            let _ = run(Command::new("ip").args(["link", "set", iface, "down"]));
            run(Command::new("ip").args([
                "link",
                "set",
                iface,
                "type",
                "can",
                "bitrate",
                &bitrate.to_string(),
            ]))?;
            run(Command::new("ip").args(["link", "set", iface, "up"]))
        }
    }

    fn bring_down(&self, iface: &str) -> io::Result<()> {
        run(Command::new("ip").args(["link", "set", iface, "down"]))
    }

    fn state(&self, iface: &str) -> io::Result<InterfaceState> {
        let output = Command::new("ip").args(["-d", "link", "show", iface]).output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!("ip link show {iface} failed")));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let state = if text.contains("state UP") || text.contains("UP,LOWER_UP") {
            LinkState::Up
        } else {
            LinkState::Down
        };
        let bitrate = text
            .split_whitespace()
            .position(|w| w == "bitrate")
            .and_then(|i| text.split_whitespace().nth(i + 1))
            .and_then(|v| v.parse::<u32>().ok());
        Ok(InterfaceState {
            name: iface.to_string(),
            state,
            bitrate,
        })
    }
}

fn run(cmd: &mut Command) -> io::Result<()> {
    let status = cmd.status()?;
    if !status.success() {
        return Err(io::Error::other(format!("command failed: {:?}", cmd)));
    }
    Ok(())
}

/// No-op controller for tests and environments without a real CAN stack.
pub struct NullInterfaceController;

impl InterfaceController for NullInterfaceController {
    fn bring_up(&self, _iface: &str, _bitrate: u32) -> io::Result<()> {
        Ok(())
    }

    fn bring_down(&self, _iface: &str) -> io::Result<()> {
        Ok(())
    }

    fn state(&self, iface: &str) -> io::Result<InterfaceState> {
        Ok(InterfaceState {
            name: iface.to_string(),
            state: LinkState::Up,
            bitrate: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_controller_reports_up() {
        let ctrl = NullInterfaceController;
        let state = ctrl.state("vcan0").unwrap();
        assert_eq!(state.state, LinkState::Up);
    }
}
