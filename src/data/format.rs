//! Demultiplexing of bias-source records into channel arrays.
//!
//! A source-measure unit returns its buffer as one flat comma-separated list,
//! `V, I, R, t, status` repeated per sample. `format_record` splits that list
//! into five parallel arrays; array `k` holds every fifth token starting at `k`.

use crate::error::{AppResult, SweepError};
use serde::{Deserialize, Serialize};

/// Number of values per sample in a bias-source record.
pub const CHANNELS: usize = 5;

/// One of the five interleaved channels of a bias-source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Forced or measured voltage (V).
    Voltage,
    /// Measured current (A).
    Current,
    /// Resistance (Ω), or the instrument's not-a-number sentinel.
    Resistance,
    /// Elapsed time since the last timer reset (s).
    Time,
    /// Instrument status word.
    Status,
}

impl Channel {
    /// Channels in record order.
    pub const ALL: [Channel; CHANNELS] = [
        Channel::Voltage,
        Channel::Current,
        Channel::Resistance,
        Channel::Time,
        Channel::Status,
    ];

    /// Column name used in CSV headers.
    pub fn name(self) -> &'static str {
        match self {
            Channel::Voltage => "voltage",
            Channel::Current => "current",
            Channel::Resistance => "resistance",
            Channel::Time => "time",
            Channel::Status => "status",
        }
    }
}

/// Five equal-length channel arrays accumulated over a run.
///
/// Records only grow: each combination appends its samples after those of the
/// combinations visited before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Voltage samples.
    pub voltage: Vec<f64>,
    /// Current samples.
    pub current: Vec<f64>,
    /// Resistance samples.
    pub resistance: Vec<f64>,
    /// Elapsed-time samples.
    pub time: Vec<f64>,
    /// Status samples.
    pub status: Vec<f64>,
}

impl MeasurementRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    /// True when no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }

    /// Samples of a single channel.
    pub fn channel(&self, channel: Channel) -> &[f64] {
        match channel {
            Channel::Voltage => &self.voltage,
            Channel::Current => &self.current,
            Channel::Resistance => &self.resistance,
            Channel::Time => &self.time,
            Channel::Status => &self.status,
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut Vec<f64> {
        match channel {
            Channel::Voltage => &mut self.voltage,
            Channel::Current => &mut self.current,
            Channel::Resistance => &mut self.resistance,
            Channel::Time => &mut self.time,
            Channel::Status => &mut self.status,
        }
    }

    /// Appends one sample.
    pub fn push_row(&mut self, row: [f64; CHANNELS]) {
        for (channel, value) in Channel::ALL.into_iter().zip(row) {
            self.channel_mut(channel).push(value);
        }
    }

    /// Appends every sample of `other` after the existing ones.
    pub fn append(&mut self, mut other: MeasurementRecord) {
        for channel in Channel::ALL {
            let samples = std::mem::take(other.channel_mut(channel));
            self.channel_mut(channel).extend(samples);
        }
    }

    /// Iterates samples as `[V, I, R, t, status]` rows.
    pub fn rows(&self) -> impl Iterator<Item = [f64; CHANNELS]> + '_ {
        (0..self.len()).map(move |i| {
            [
                self.voltage[i],
                self.current[i],
                self.resistance[i],
                self.time[i],
                self.status[i],
            ]
        })
    }
}

/// Splits a raw comma-separated record into its five channels.
///
/// Fails with `DataShape` when the token count is not a multiple of
/// [`CHANNELS`]; nothing is truncated. A blank record yields an empty
/// `MeasurementRecord`.
pub fn format_record(raw: &str) -> AppResult<MeasurementRecord> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(MeasurementRecord::new());
    }

    let tokens: Vec<&str> = raw.split(',').map(str::trim).collect();
    if tokens.len() % CHANNELS != 0 {
        return Err(SweepError::DataShape {
            tokens: tokens.len(),
            channels: CHANNELS,
        });
    }

    let mut record = MeasurementRecord::new();
    for chunk in tokens.chunks_exact(CHANNELS) {
        let mut row = [0.0; CHANNELS];
        for (slot, token) in row.iter_mut().zip(chunk) {
            *slot = token
                .parse::<f64>()
                .map_err(|e| SweepError::Parse(format!("'{}': {}", token, e)))?;
        }
        record.push_row(row);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn demultiplexes_interleaved_samples() {
        let raw = "1.0,1e-6,1e6,0.1,0,2.0,2e-6,1e6,0.2,0";
        let record = format_record(raw).unwrap();

        assert_eq!(record.len(), 2);
        assert_eq!(record.voltage, vec![1.0, 2.0]);
        assert_eq!(record.current, vec![1e-6, 2e-6]);
        assert_eq!(record.resistance, vec![1e6, 1e6]);
        assert_eq!(record.time, vec![0.1, 0.2]);
        assert_eq!(record.status, vec![0.0, 0.0]);
    }

    #[test]
    fn tolerates_whitespace_and_trailing_newline() {
        let record = format_record(" +5.0E+00, +1.2E-03 ,+9.91E+37,+4.5E+00,+1.94E+04\n").unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record.current, vec![1.2e-3]);
        assert_eq!(record.status, vec![19400.0]);
    }

    #[test]
    fn rejects_partial_sample() {
        let err = format_record("1,2,3,4,5,6,7").unwrap_err();
        assert!(matches!(
            err,
            SweepError::DataShape {
                tokens: 7,
                channels: 5
            }
        ));
    }

    #[test]
    fn rejects_non_numeric_token() {
        let err = format_record("1,2,abc,4,5").unwrap_err();
        assert!(matches!(err, SweepError::Parse(_)));
    }

    #[test]
    fn blank_record_is_empty() {
        assert!(format_record("  \n").unwrap().is_empty());
    }

    #[test]
    fn append_preserves_visit_order() {
        let mut acc = format_record("0,0,0,0,0").unwrap();
        acc.append(format_record("1,1,1,1,1,2,2,2,2,2").unwrap());

        assert_eq!(acc.voltage, vec![0.0, 1.0, 2.0]);
        assert_eq!(acc.rows().last(), Some([2.0; CHANNELS]));
    }

    proptest! {
        #[test]
        fn interleave_law(values in proptest::collection::vec(-1e3f64..1e3, 0..40usize)) {
            let k = values.len() / CHANNELS;
            let values = &values[..k * CHANNELS];
            let raw = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",");

            let record = format_record(&raw).unwrap();
            prop_assert_eq!(record.len(), k);
            for (c, channel) in Channel::ALL.into_iter().enumerate() {
                let samples = record.channel(channel);
                prop_assert_eq!(samples.len(), k);
                for i in 0..k {
                    prop_assert_eq!(samples[i], values[CHANNELS * i + c]);
                }
            }
        }

        #[test]
        fn non_multiple_lengths_are_rejected(n in 1usize..60) {
            prop_assume!(n % CHANNELS != 0);
            let raw = vec!["1"; n].join(",");
            let is_shape_error = matches!(format_record(&raw), Err(SweepError::DataShape { .. }));
            prop_assert!(is_shape_error);
        }
    }
}
