//! LoRa time-on-air estimation (Semtech AN1200.13).

use std::time::Duration;

/// Preamble symbols used by this network.
const PREAMBLE_SYMBOLS: f64 = 8.0;
/// Coding rate 4/5.
const CODING_RATE: f64 = 1.0;

/// Estimates the on-air time of a physical payload at the given spreading
/// factor and bandwidth, explicit header and CRC on.
pub fn time_on_air(payload_len: usize, spreading_factor: u8, bandwidth_hz: u32) -> Duration {
    let sf = f64::from(spreading_factor.clamp(7, 12));
    let bw = f64::from(bandwidth_hz.max(1));
    let symbol_time_s = 2f64.powf(sf) / bw;

    // Low-data-rate optimization is mandatory at SF11/SF12 on 125 kHz.
    let de = if spreading_factor >= 11 && bandwidth_hz <= 125_000 {
        1.0
    } else {
        0.0
    };

    let pl = payload_len as f64;
    let numerator = 8.0 * pl - 4.0 * sf + 28.0 + 16.0;
    let denominator = 4.0 * (sf - 2.0 * de);
    let payload_symbols = 8.0 + ((numerator / denominator).ceil() * (CODING_RATE + 4.0)).max(0.0);

    let preamble_time = (PREAMBLE_SYMBOLS + 4.25) * symbol_time_s;
    let payload_time = payload_symbols * symbol_time_s;
    Duration::from_secs_f64(preamble_time + payload_time)
}
