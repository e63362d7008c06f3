//! Radio driver framework: a small trait any declarative transport (HF/ALE,
//! Bluetooth name field, Wi-Fi Direct service info, ...) implements so the
//! scheduler can drive it without knowing its specifics.

use std::time::Duration;

/// One outcome of a single `service` tick: either the driver consumed some
/// time doing useful work, or it has nothing to do and the scheduler may
/// move on to another phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceResult {
    Progressed,
    Idle,
}

/// Common surface every radio transport implements. Transports are polled
/// cooperatively; none of these calls may block for longer than
/// `max_block`, and most should return promptly.
pub trait RadioDriver {
    /// Stable identifier used in config and logs (e.g. `"hfbarrett"`).
    fn name(&self) -> &'static str;

    /// True once the underlying link is ready to accept `send_packet`
    /// calls (mirrors the original's `*_ready_test`).
    fn ready(&self) -> bool;

    /// Services the driver's state machine: reads any pending bytes,
    /// advances ALE/link-establishment state, and feeds complete inbound
    /// packets to `on_receive`. Never blocks longer than `max_block`.
    fn service(
        &mut self,
        max_block: Duration,
        on_receive: &mut dyn FnMut(&[u8]),
    ) -> anyhow::Result<ServiceResult>;

    /// Queues `packet` for transmission to the current or named partner.
    /// Returns `Ok(true)` if the packet was accepted, `Ok(false)` if the
    /// driver is busy and the caller should retry later.
    fn send_packet(&mut self, packet: &[u8]) -> anyhow::Result<bool>;
}
