// SPDX-License-Identifier: Apache-2.0

use std::{fmt, net::Ipv4Addr, num::ParseFloatError, time::Duration};

use clap::{Parser, ValueEnum};
use isyslink::{
    acquisition::RetryPolicy,
    geo::GeoPoint,
    tracking::{IgnoreZone, ProductCode, TrackerError},
};
use tracing::level_filters::LevelFilter;

#[derive(Debug)]
pub enum Error {
    InvalidVertex(String),
    InvalidCoordinate(ParseFloatError),
    InvalidZone(TrackerError),
}

impl std::error::Error for Error {}

impl From<ParseFloatError> for Error {
    fn from(err: ParseFloatError) -> Error {
        Error::InvalidCoordinate(err)
    }
}

impl From<TrackerError> for Error {
    fn from(err: TrackerError) -> Error {
        Error::InvalidZone(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidVertex(value) => write!(f, "invalid vertex {:?}, expected x,y", value),
            Error::InvalidCoordinate(err) => write!(f, "invalid coordinate: {}", err),
            Error::InvalidZone(err) => write!(f, "invalid ignore zone: {}", err),
        }
    }
}

/// How the acquisition loop waits after a target list was already
/// requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum RetryMode {
    Fixed,
    Exponential,
}

impl fmt::Display for RetryMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RetryMode::Fixed => write!(f, "fixed"),
            RetryMode::Exponential => write!(f, "exponential"),
        }
    }
}

/// Parses a polygon given as space separated `x,y` vertices in meters.
fn parse_zone(s: &str) -> Result<IgnoreZone, Error> {
    let vertices = s
        .split_whitespace()
        .map(|vertex| match vertex.split_once(',') {
            Some((x, y)) => Ok([x.trim().parse::<f32>()?, y.trim().parse::<f32>()?]),
            None => Err(Error::InvalidVertex(vertex.to_string())),
        })
        .collect::<Result<Vec<[f32; 2]>, Error>>()?;
    Ok(IgnoreZone::new(&vertices)?)
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// local interface address the sensor sends to
    #[arg(long, env, default_value = "192.168.60.20")]
    pub ip: Ipv4Addr,

    /// local UDP port the sensor sends to
    #[arg(long, env, default_value = "2050")]
    pub port: u16,

    /// milliseconds to wait for a target list
    #[arg(long, env, default_value = "1000")]
    pub timeout: u64,

    /// kernel receive buffer size in bytes
    #[arg(long, env, default_value = "1048576")]
    pub recv_buffer: usize,

    /// retry strategy when the target list was already requested
    #[arg(long, env, default_value = "fixed")]
    pub retry: RetryMode,

    /// first (or only) retry delay in milliseconds
    #[arg(long, env, default_value = "10")]
    pub retry_delay: u64,

    /// longest exponential retry delay in milliseconds
    #[arg(long, env, default_value = "500")]
    pub retry_max: u64,

    /// stop after this many cycles, runs until interrupted when unset
    #[arg(long, env)]
    pub cycles: Option<u64>,

    /// print one JSON object per frame instead of the strongest target table
    #[arg(long, env)]
    pub json: bool,

    /// run the tracker on every frame
    #[arg(long, env)]
    pub tracking: bool,

    /// sensor model used for the tracker defaults
    #[arg(long, env, default_value = "5021")]
    pub product: ProductCode,

    /// tracker cycle time in seconds
    #[arg(long, env, default_value = "0.1")]
    pub cycle_time: f32,

    /// sensor installation height in meters
    #[arg(long, env, default_value = "3.0")]
    pub installation_height: f32,

    /// sensor installation azimuth in degrees
    #[arg(long, env, default_value = "0.0", allow_hyphen_values = true)]
    pub installation_angle: f32,

    /// ignore zone as space separated x,y vertices, may be repeated
    #[arg(long, value_parser = parse_zone, allow_hyphen_values = true)]
    pub ignore_zone: Vec<IgnoreZone>,

    /// sensor latitude in decimal degrees, enables target positions
    #[arg(long, env, requires = "radar_lon", allow_hyphen_values = true)]
    pub radar_lat: Option<f64>,

    /// sensor longitude in decimal degrees
    #[arg(long, env, requires = "radar_lat", allow_hyphen_values = true)]
    pub radar_lon: Option<f64>,

    /// consecutive recoverable poll errors tolerated before exiting
    #[arg(long, env, default_value = "10")]
    pub max_errors: u32,

    /// run the receive loop with SCHED_FIFO priority
    #[arg(long, env)]
    pub realtime: bool,

    /// Application log level
    #[arg(long, env, default_value = "info")]
    pub rust_log: LevelFilter,

    /// Enable Tracy profiler broadcast
    #[arg(long, env)]
    pub tracy: bool,
}

impl Args {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Sensor location, when both coordinates were given.
    pub fn radar_position(&self) -> Option<GeoPoint> {
        Some(GeoPoint::new(self.radar_lat?, self.radar_lon?))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_millis(self.retry_delay);
        match self.retry {
            RetryMode::Fixed => RetryPolicy::Fixed(initial),
            RetryMode::Exponential => RetryPolicy::Exponential {
                initial,
                max: Duration::from_millis(self.retry_max).max(initial),
            },
        }
    }
}
