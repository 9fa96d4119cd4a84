// SPDX-License-Identifier: Apache-2.0

//! iSYS Target List Library
//!
//! This library receives target lists from InnoSenT iSYS-5021 (and
//! compatible) radar sensors over Ethernet and optionally tracks the detected
//! objects.
//!
//! # Features
//!
//! - **Ethernet Interface** - Decode and assemble target list frames from UDP
//! - **Session** - Open, poll and close a sensor connection
//! - **Acquisition** - Request/retry/process cycles with configurable backoff
//! - **Tracking** - DBSCAN clustering with Kalman filtered tracks
//! - **Georeferencing** - Latitude and longitude of targets and tracks
//!
//! The `isysread` binary ties these together and prints the strongest target
//! of every frame.

/// Target list wire format and frame assembly
pub mod eth;

/// UDP socket setup
pub mod net;

/// Sensor sessions
pub mod session;

/// Request, retry and process cycles
pub mod acquisition;

/// Clustering and tracking algorithms
pub mod tracking;

/// Sensor relative positions to latitude and longitude
pub mod geo;
