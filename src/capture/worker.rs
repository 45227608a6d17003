use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::sink::PacketChannel;
use super::stream::{CaptureStream, PendingJob};
use super::wire::{self, DataHeader, FormatMessage, MessageHeader};

// ── Capture worker ──

/// Spawn the per-stream capture worker.
///
/// The worker exists to keep the producer path async-signal-safe: it does
/// the blocking packet I/O and any scratch reallocation on the producer's
/// behalf. One worker per stream, respawned on renegotiation.
pub(crate) fn spawn_capture_worker(
    stream: Arc<CaptureStream>,
    mut packet: Box<dyn PacketChannel>,
    stream_id: u32,
    async_mode: bool,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("pcm-capture".into())
        .spawn(move || {
            set_realtime_priority();
            run(&stream, packet.as_mut(), stream_id, async_mode);
        })
}

fn run(stream: &CaptureStream, packet: &mut dyn PacketChannel, stream_id: u32, async_mode: bool) {
    let mut emitted: u64 = 0;
    stream.ready.store(true, Ordering::SeqCst);

    let result = loop {
        stream.full.wait();
        stream.ready.store(false, Ordering::SeqCst);

        if !stream.running.load(Ordering::SeqCst) {
            break Ok(());
        }

        // The state borrow is exclusive between the full wake-up and the
        // ready/empty hand-back, and must end before that hand-back: the
        // producer may re-enter the moment either one is visible.
        let outcome: io::Result<bool> = {
            let state = unsafe { &mut *stream.state() };
            match state.pending {
                PendingJob::Grow(size) => {
                    // Grow on the producer's behalf; no emission and no
                    // empty hand-back, the producer already reported Busy
                    // for the period that wanted this.
                    if state.grow_scratch(size).is_err() {
                        log::error!(
                            "stream {}: deferred scratch grow to {} bytes failed",
                            stream_id,
                            size
                        );
                    }
                    Ok(false)
                }
                PendingJob::Emit(size) => {
                    let hdr = DataHeader {
                        stream_id,
                        timestamp_ns: state.capture_time_ns,
                        size: size as u64,
                    };
                    emit_period(packet, &hdr, &state.scratch[..size]).map(|()| true)
                }
                PendingJob::Idle => Ok(false),
            }
        };
        match outcome {
            Err(e) => break Err(e),
            Ok(true) => {
                emitted += 1;
                if !async_mode {
                    stream.empty.post();
                }
            }
            Ok(false) => {}
        }
        stream.ready.store(true, Ordering::SeqCst);
    };

    if let Err(e) = result {
        // Terminal for this stream's emission: go silent until the next
        // renegotiation respawns us. Release any blocked producer first.
        log::error!("stream {}: capture worker failed: {}", stream_id, e);
        stream.running.store(false, Ordering::SeqCst);
        if !async_mode {
            stream.empty.post();
        }
        stream.ready.store(true, Ordering::SeqCst);
    }

    log::info!(
        "stream {}: capture worker exiting: {} periods emitted, {} skipped, {} deferred grows, max period {} bytes",
        stream_id,
        emitted,
        stream.stats.periods_skipped.load(Ordering::Relaxed),
        stream.stats.grows_deferred.load(Ordering::Relaxed),
        stream.stats.max_period_bytes.load(Ordering::Relaxed),
    );
}

/// One captured period as a single downstream packet.
fn emit_period(
    packet: &mut dyn PacketChannel,
    hdr: &DataHeader,
    payload: &[u8],
) -> io::Result<()> {
    packet.open()?;
    packet.set_size(wire::MESSAGE_HEADER_LEN + wire::DATA_HEADER_LEN + payload.len())?;
    packet.write(&MessageHeader { kind: wire::MSG_AUDIO_DATA }.to_bytes())?;
    packet.write(&hdr.to_bytes())?;
    packet.write(payload)?;
    packet.close()
}

/// The stream's format announcement as a single downstream packet. Emitted
/// from the negotiation path before the worker spawns, so every data message
/// for a stream id is preceded by its format.
pub(crate) fn emit_format(packet: &mut dyn PacketChannel, msg: &FormatMessage) -> io::Result<()> {
    packet.open()?;
    packet.set_size(wire::MESSAGE_HEADER_LEN + wire::FORMAT_MESSAGE_LEN)?;
    packet.write(&MessageHeader { kind: wire::MSG_AUDIO_FORMAT }.to_bytes())?;
    packet.write(&msg.to_bytes())?;
    packet.close()
}

/// Advisory: ask for round-robin realtime scheduling so emission keeps up
/// with the host's period cadence. Refusal (no rtprio privilege) is fine.
fn set_realtime_priority() {
    let param = libc::sched_param {
        sched_priority: unsafe { libc::sched_get_priority_min(libc::SCHED_RR) },
    };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) };
    if rc != 0 {
        log::debug!("capture worker: realtime scheduling unavailable ({})", rc);
    }
}
