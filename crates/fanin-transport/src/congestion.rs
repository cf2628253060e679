//! # ECN-driven AIMD window control
//!
//! The only congestion signal is the ECN bit echoed on ACKs; there is no
//! RTT estimation and no loss-based backoff at this layer. Each ACK either
//! shrinks the window multiplicatively (`W ← max(W_min, ⌊W·β⌋)`) or grows
//! it additively (`W ← min(W_max, W + α/W)`).

/// AIMD parameters.
#[derive(Debug, Clone)]
pub struct AimdConfig {
    /// Additive increase numerator: each clean ACK adds `alpha / W`.
    pub alpha: f64,
    /// Multiplicative decrease factor applied on an ECN-marked ACK.
    pub beta: f64,
    /// Window floor in packets.
    pub min_window: u32,
    /// Window ceiling in packets.
    pub max_window: u32,
}

impl Default for AimdConfig {
    fn default() -> Self {
        AimdConfig {
            alpha: 1.0,
            beta: 0.5,
            min_window: 2,
            max_window: 1024,
        }
    }
}

/// Congestion window controller for one worker.
#[derive(Debug, Clone)]
pub struct AimdController {
    config: AimdConfig,
    /// Fractional window; the integer floor is what the sender sees.
    window: f64,
}

impl AimdController {
    pub fn new(initial_window: u32, config: AimdConfig) -> Self {
        let window = f64::from(initial_window.clamp(config.min_window, config.max_window));
        AimdController { config, window }
    }

    /// Adjust the window for one ACK and return the new size in packets.
    pub fn on_ack(&mut self, ecn: bool) -> u32 {
        if ecn {
            self.window =
                (self.window * self.config.beta).floor().max(f64::from(self.config.min_window));
        } else {
            self.window =
                (self.window + self.config.alpha / self.window).min(f64::from(self.config.max_window));
        }
        self.window as u32
    }

    /// Current window size in packets.
    pub fn window(&self) -> u32 {
        self.window as u32
    }
}
