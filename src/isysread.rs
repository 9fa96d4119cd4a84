// SPDX-License-Identifier: Apache-2.0

mod args;

use std::{future::Future, pin::Pin, process::ExitCode, thread};

use args::Args;
use clap::Parser;
use isyslink::{
    acquisition::{Acquisition, Cycle},
    eth::{Error, TargetList},
    geo::Direction,
    net,
    session::{api_version, Session},
    tracking::{execute_cycle, ClusterTracker, Track, Tracker, TrackerError},
};
use kanal::{AsyncReceiver, AsyncSender};
use serde_json::json;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt as _, Layer as _, Registry};
use tracy_client::{frame_mark, plot, secondary_frame_mark};

#[cfg(feature = "profiling")]
#[global_allocator]
static GLOBAL: tracy_client::ProfiledAllocator<std::alloc::System> =
    tracy_client::ProfiledAllocator::new(std::alloc::System, 100);

const EXIT_OPEN: u8 = 2;
const EXIT_POLL: u8 = 3;
const EXIT_CLOSE: u8 = 4;
const EXIT_TRACKER: u8 = 5;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    args.tracy.then(tracy_client::Client::start);

    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(std::io::stderr)
        .with_filter(args.rust_log);

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(args.rust_log)),
        Err(_) => None,
    };

    let tracy = match args.tracy {
        true => Some(tracing_tracy::TracyLayer::default().with_filter(args.rust_log)),
        false => None,
    };

    let subscriber = Registry::default()
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", err);
        return ExitCode::FAILURE;
    }
    if let Err(err) = tracing_log::LogTracer::init() {
        eprintln!("log tracer init failed: {}", err);
        return ExitCode::FAILURE;
    }

    info!("target list API version {:.1}", api_version());

    let session = match Session::open_with_buffer(args.ip, args.port, args.recv_buffer).await {
        Ok(session) => session.with_timeout(args.timeout()),
        Err(err) => {
            error!(
                "cannot open session on {}:{}: {} (code {})",
                args.ip,
                args.port,
                err,
                err.code()
            );
            return ExitCode::from(EXIT_OPEN);
        }
    };

    let tracking = if args.tracking {
        let (tx, rx) = kanal::bounded_async(16);
        let thread_args = args.clone();

        let handle = thread::Builder::new()
            .name("tracker".to_string())
            .spawn(move || {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|err| TrackerError::Processing(err.to_string()))?
                    .block_on(tracking_task(thread_args, rx))
            });

        match handle {
            Ok(handle) => Some((tx, handle)),
            Err(err) => {
                error!("cannot start tracker thread: {}", err);
                return ExitCode::from(EXIT_TRACKER);
            }
        }
    } else {
        None
    };

    if args.realtime {
        net::set_process_priority();
    }

    let mut acquisition = Acquisition::new(session, args.retry_policy());
    let sender = tracking.as_ref().map(|(tx, _)| tx.clone());
    let mut code = stream(&mut acquisition, &args, sender).await;

    let stats = acquisition.stats();
    info!(
        "{} frames ({} full), {} retries, {} idle, {} discarded, {} errors, {} lost",
        stats.frames,
        stats.full,
        stats.retries,
        stats.idle,
        stats.discarded,
        stats.errors,
        acquisition.source_mut().frames_lost()
    );

    if let Some((tx, handle)) = tracking {
        drop(tx);
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!("tracker failed: {} (code {})", err, err.code());
                code = code.or(Some(EXIT_TRACKER));
            }
            Err(_) => {
                error!("tracker thread panicked");
                code = code.or(Some(EXIT_TRACKER));
            }
        }
    }

    let mut session = acquisition.into_inner();
    if let Err(err) = session.close() {
        error!("cannot close session: {} (code {})", err, err.code());
        return ExitCode::from(EXIT_CLOSE);
    }

    match code {
        Some(code) => ExitCode::from(code),
        None => ExitCode::SUCCESS,
    }
}

/// Runs acquisition cycles until interrupted, the cycle limit is reached or
/// polling fails for good.  Returns the exit code of a failure.
async fn stream(
    acquisition: &mut Acquisition<Session>,
    args: &Args,
    tracking: Option<AsyncSender<Cycle>>,
) -> Option<u8> {
    if !args.json {
        let mut columns =
            "FrameID, NrOfTargets, Angle, Range, Velocity, Signal, Direction".to_string();
        if args.radar_position().is_some() {
            columns.push_str(", Latitude, Longitude");
        }
        println!("{}", columns);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut cycles = 0u64;
    let mut errors = 0u32;
    loop {
        if args.cycles.is_some_and(|limit| cycles >= limit) {
            return None;
        }
        cycles += 1;

        let cycle = match until_interrupted(acquisition.next_cycle(), &mut ctrl_c).await {
            Some(cycle) => cycle,
            None => {
                info!("interrupted");
                return None;
            }
        };

        let cycle = match cycle {
            Ok(cycle) => {
                errors = 0;
                cycle
            }
            Err(err) => {
                errors = errors.saturating_add(1);
                if let Some(code) = poll_exit_code(&err, errors, args.max_errors) {
                    error!("target list request failed: {} (code {})", err, err.code());
                    return Some(code);
                }
                warn!(
                    "target list request failed: {} (code {}), {} of {} tolerated",
                    err,
                    err.code(),
                    errors,
                    args.max_errors
                );
                continue;
            }
        };

        if let Some(list) = cycle.targets() {
            args.tracy.then(|| plot!("targets", list.len() as f64));
            print_target_list(list, args);
            args.tracy.then(frame_mark);
        }

        if let Some(tx) = &tracking {
            match until_interrupted(tx.send(cycle), &mut ctrl_c).await {
                Some(Ok(())) => {}
                Some(Err(_)) => {
                    warn!("tracker stopped");
                    return Some(EXIT_TRACKER);
                }
                None => {
                    info!("interrupted");
                    return None;
                }
            }
        }
    }
}

/// Runs `fut` unless `interrupt` completes first.  The interrupt is borrowed
/// so one signal registration spans every await of the loop.
async fn until_interrupted<F, I>(fut: F, interrupt: &mut Pin<&mut I>) -> Option<F::Output>
where
    F: Future,
    I: Future,
{
    tokio::select! {
        output = fut => Some(output),
        _ = interrupt => None,
    }
}

/// Exit code for a failed poll, `None` when the loop should carry on.  Lost
/// or closed sessions end the loop at once, other errors once `errors`
/// consecutive failures exceed `max_errors`.
fn poll_exit_code(err: &Error, errors: u32, max_errors: u32) -> Option<u8> {
    let fatal = err.is_terminal() || matches!(err, Error::HandleNotInitialized);
    (fatal || errors > max_errors).then_some(EXIT_POLL)
}

fn print_target_list(list: &TargetList, args: &Args) {
    let strongest = list.strongest();
    let direction = Direction::from_velocity(strongest.velocity);
    let position = args.radar_position().map(|radar| {
        let azimuth = strongest.angle_azimuth + args.installation_angle;
        radar.target_position(strongest.range as f64, azimuth as f64)
    });

    if args.json {
        let mut msg = json!({
            "frame_id": list.frame_id(),
            "targets": list.len(),
            "strongest": {
                "angle": strongest.angle_azimuth,
                "range": strongest.range,
                "velocity": strongest.velocity,
                "signal": strongest.signal_strength,
                "direction": direction.to_string(),
            },
        });
        if let Some(position) = position {
            msg["strongest"]["latitude"] = json!(position.latitude);
            msg["strongest"]["longitude"] = json!(position.longitude);
        }
        println!("{}", msg);
    } else {
        match position {
            Some(position) => println!(
                "{},\t {},\t{},\t{},\t{}",
                list.frame_id(),
                list.len(),
                strongest,
                direction,
                position
            ),
            None => println!(
                "{},\t {},\t{},\t{}",
                list.frame_id(),
                list.len(),
                strongest,
                direction
            ),
        }
    }
}

async fn tracking_task(args: Args, rx: AsyncReceiver<Cycle>) -> Result<(), TrackerError> {
    let mut tracker = ClusterTracker::new(args.cycle_time)?;
    tracker.set_default_values(args.product)?;
    tracker.set_installation_height(args.installation_height)?;
    tracker.set_installation_angle(args.installation_angle)?;
    tracker.set_ignore_zones(&args.ignore_zone)?;
    info!(
        "tracking {} at {} m height, {} deg, {} ignore zones",
        args.product,
        tracker.installation_height(),
        tracker.installation_angle(),
        tracker.ignore_zones().len()
    );

    // Ends when the acquisition loop drops its sender.
    while let Ok(cycle) = rx.recv().await {
        let frame_id = cycle.targets().map(|list| list.frame_id());
        let tracks = info_span!("tracking").in_scope(|| execute_cycle(&mut tracker, &cycle))?;
        let tracks = match tracks {
            Some(tracks) => tracks,
            None => continue,
        };

        if let Some(frame_id) = frame_id {
            print_tracks(frame_id, &tracks, &args);
        }
        args.tracy.then(|| secondary_frame_mark!("tracking"));
    }

    Ok(())
}

fn print_tracks(frame_id: u16, tracks: &[Track], args: &Args) {
    let radar = args.radar_position();
    let position =
        |t: &Track| radar.map(|radar| radar.offset(t.position_x as f64, t.position_y as f64));

    if args.json {
        let tracks: Vec<_> = tracks
            .iter()
            .map(|t| {
                let mut track = json!({
                    "id": t.object_id,
                    "class": t.class.to_string(),
                    "quality": t.quality,
                    "age": t.age_count,
                    "position": [t.position_x, t.position_y],
                    "velocity": [t.velocity_x, t.velocity_y],
                });
                if let Some(position) = position(t) {
                    track["latitude"] = json!(position.latitude);
                    track["longitude"] = json!(position.longitude);
                }
                track
            })
            .collect();
        println!("{}", json!({ "frame_id": frame_id, "tracks": tracks }));
    } else {
        for t in tracks {
            let geo = position(t).map_or(String::new(), |p| format!(",\t{}", p));
            println!(
                "  track {}:\t{},\tq={:.2},\tpos=({:.2}, {:.2}),\tvel=({:.2}, {:.2}){}",
                t.object_id,
                t.class,
                t.quality,
                t.position_x,
                t.position_y,
                t.velocity_x,
                t.velocity_y,
                geo
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, Instant};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_spans_cycles() {
        let interrupt = sleep(Duration::from_millis(100));
        tokio::pin!(interrupt);

        assert_eq!(until_interrupted(async { 1 }, &mut interrupt).await, Some(1));
        let cycle = sleep(Duration::from_millis(60));
        assert_eq!(until_interrupted(cycle, &mut interrupt).await, Some(()));

        // The deadline set before the first cycle still holds.
        let start = Instant::now();
        let pending = std::future::pending::<()>();
        assert_eq!(until_interrupted(pending, &mut interrupt).await, None);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_blocked_send() {
        let (tx, _rx) = kanal::bounded_async::<u32>(1);
        tx.send(1).await.unwrap();

        let interrupt = sleep(Duration::from_millis(10));
        tokio::pin!(interrupt);
        assert!(until_interrupted(tx.send(2), &mut interrupt).await.is_none());
    }

    #[test]
    fn test_recoverable_errors_continue() {
        assert_eq!(poll_exit_code(&Error::TargetDataSize(12), 1, 10), None);
        assert_eq!(poll_exit_code(&Error::CommunicationTimeout, 10, 10), None);
        let not_enough = Error::TargetNotEnoughData {
            announced: 50,
            received: 42,
        };
        assert_eq!(poll_exit_code(&not_enough, 3, 10), None);
    }

    #[test]
    fn test_repeated_errors_exit() {
        assert_eq!(
            poll_exit_code(&Error::CommunicationTimeout, 11, 10),
            Some(EXIT_POLL)
        );
        assert_eq!(poll_exit_code(&Error::TargetDataSize(12), 1, 0), Some(EXIT_POLL));
    }

    #[test]
    fn test_lost_session_exits() {
        assert_eq!(poll_exit_code(&Error::ConnectionReset, 1, 10), Some(EXIT_POLL));
        assert_eq!(poll_exit_code(&Error::ConnectionLost, 1, 10), Some(EXIT_POLL));
        assert_eq!(
            poll_exit_code(&Error::HandleNotInitialized, 1, 10),
            Some(EXIT_POLL)
        );
    }
}
