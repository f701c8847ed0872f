//! Time-ordered sample buffers.
//!
//! Each sensor stream is buffered until its samples fall behind the delayed
//! fusion horizon. Buffers are bounded and allocated once at initialization;
//! pushing into a full buffer drops the oldest sample so a stalled consumer
//! can never grow memory.

use std::collections::VecDeque;

use nalgebra::UnitQuaternion;
use nav_types::{
    AirspeedSample, BaroSample, FlowSample, GpsMessage, ImuSample, MagSample, RangeSample,
    Timestamp, VisionSample,
};

/// Samples that carry a monotonic timestamp.
pub trait Timestamped {
    /// Timestamp of the sample.
    fn time_us(&self) -> Timestamp;
}

macro_rules! impl_timestamped {
    ($($ty:ty),* $(,)?) => {
        $(impl Timestamped for $ty {
            fn time_us(&self) -> Timestamp {
                self.time_us
            }
        })*
    };
}

impl_timestamped!(
    ImuSample,
    GpsMessage,
    MagSample,
    BaroSample,
    RangeSample,
    FlowSample,
    AirspeedSample,
    VisionSample,
);

/// A bounded time-ordered FIFO for one sensor stream.
///
/// # Example
///
/// ```
/// use nav_ekf::buffer::SampleBuffer;
/// use nav_types::{BaroSample, Timestamp};
///
/// let mut buffer = SampleBuffer::new(8);
/// buffer.push(BaroSample::new(Timestamp::from_millis(10), 1.0));
/// buffer.push(BaroSample::new(Timestamp::from_millis(20), 2.0));
///
/// // Nothing is older than 15 ms... except the 10 ms sample.
/// let sample = buffer.pop_first_older_than(Timestamp::from_millis(15));
/// assert!(sample.is_some());
/// assert!(buffer.pop_first_older_than(Timestamp::from_millis(15)).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct SampleBuffer<T> {
    capacity: usize,
    samples: VecDeque<T>,
    newest_time: Timestamp,
}

impl<T: Timestamped> SampleBuffer<T> {
    /// Creates a buffer holding at most `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            newest_time: Timestamp::zero(),
        }
    }

    /// Number of buffered samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if no samples are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp of the newest sample ever accepted.
    #[must_use]
    pub const fn newest_time(&self) -> Timestamp {
        self.newest_time
    }

    /// Pushes a sample, dropping the oldest if the buffer is full.
    ///
    /// Samples whose timestamp does not advance past the newest accepted
    /// sample are rejected; returns `true` if the sample was accepted.
    pub fn push(&mut self, sample: T) -> bool {
        let time = sample.time_us();
        if !self.samples.is_empty() && time <= self.newest_time {
            return false;
        }
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.newest_time = time;
        self.samples.push_back(sample);
        true
    }

    /// Pops the oldest sample if it has fallen behind `horizon`.
    pub fn pop_first_older_than(&mut self, horizon: Timestamp) -> Option<T> {
        let front_time = self.samples.front()?.time_us();
        if front_time <= horizon {
            self.samples.pop_front()
        } else {
            None
        }
    }

    /// Oldest buffered sample, without removing it.
    #[must_use]
    pub fn oldest(&self) -> Option<&T> {
        self.samples.front()
    }

    /// Newest buffered sample, without removing it.
    #[must_use]
    pub fn newest(&self) -> Option<&T> {
        self.samples.back()
    }

    /// Drops all buffered samples. The regression guard keeps its watermark.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Iterates over buffered samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    /// Mutable iteration, oldest first. Used when a state reset has to be
    /// propagated through already-buffered output samples.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.samples.iter_mut()
    }
}

/// Downsamples sensor-rate IMU data to the filter update period.
///
/// Delta angles are combined by quaternion composition so that coning motion
/// is preserved; delta velocities are rotated into the frame at the start of
/// the accumulation interval before summing.
#[derive(Debug, Clone)]
pub struct ImuDownSampler {
    target_dt: f64,
    accumulated: ImuSample,
    delta_quat: UnitQuaternion<f64>,
}

impl ImuDownSampler {
    /// Creates a downsampler targeting the given filter period (s).
    #[must_use]
    pub fn new(target_dt: f64) -> Self {
        Self {
            target_dt,
            accumulated: ImuSample::default(),
            delta_quat: UnitQuaternion::identity(),
        }
    }

    /// Accumulates one sensor-rate sample. Returns the combined sample once
    /// the accumulated interval reaches the filter period.
    pub fn update(&mut self, imu: &ImuSample) -> Option<ImuSample> {
        self.accumulated.time_us = imu.time_us;
        self.accumulated.delta_ang_dt += imu.delta_ang_dt;
        self.accumulated.delta_vel_dt += imu.delta_vel_dt;

        // Rotation accumulated so far maps the current body frame back to
        // the frame at the start of the interval.
        self.delta_quat *= UnitQuaternion::from_scaled_axis(imu.delta_ang);
        self.accumulated.delta_vel += self.delta_quat * imu.delta_vel;

        if self.accumulated.delta_ang_dt >= self.target_dt {
            self.accumulated.delta_ang = self.delta_quat.scaled_axis();
            let combined = self.accumulated;
            self.reset();
            Some(combined)
        } else {
            None
        }
    }

    /// Discards any partial accumulation.
    pub fn reset(&mut self) {
        self.accumulated = ImuSample::default();
        self.delta_quat = UnitQuaternion::identity();
    }
}
