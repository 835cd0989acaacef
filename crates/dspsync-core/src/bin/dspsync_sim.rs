//! dspsync-sim - runs the sync engine against the in-process coprocessor
//!
//! A clock thread plays the firmware's part, completing one frame per frame
//! period. The engine queues a few tones on two channels, goes through a
//! sleep/wake cycle and reports what the coprocessor consumed.
//!
//! ## Command line flags
//!
//! - `--config <path>`: YAML config (defaults to ~/.config/dspsync/config.yaml)
//! - `--seconds <n>`: how long to play (default 2)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use dspsync_core::channel::{WaveBufStatus, WaveBuffer};
use dspsync_core::config::{default_config_path, load_config, SyncConfig};
use dspsync_core::driver::loopback::LoopbackDriver;
use dspsync_core::{DspBuilder, PowerEvent, SampleFormat, FRAME_SAMPLES, SAMPLE_RATE};

/// Firmware image handed to the loopback coprocessor
const SIM_FIRMWARE: &[u8] = b"dspsync loopback component";

fn sine(hz: f32, samples: usize) -> Arc<[u8]> {
    (0..samples)
        .map(|n| {
            let phase = 2.0 * std::f32::consts::PI * hz * n as f32 / SAMPLE_RATE;
            (phase.sin() * i16::MAX as f32 * 0.5) as i16
        })
        .flat_map(i16::to_ne_bytes)
        .collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let flag = |name: &str| {
        args.iter()
            .position(|arg| arg == name)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let config_path = flag("--config").map(Into::into).unwrap_or_else(default_config_path);
    let config: SyncConfig = load_config(&config_path);
    let seconds: u64 = flag("--seconds")
        .map(|s| s.parse().context("--seconds expects a whole number"))
        .transpose()?
        .unwrap_or(2);

    let driver = Arc::new(LoopbackDriver::new());
    let (power_tx, power_rx) = crossbeam::channel::unbounded();
    let dsp = DspBuilder::new(driver.clone())
        .config(config.clone())
        .power_events(power_rx)
        .build();
    dsp.use_component(SIM_FIRMWARE.to_vec(), config.bank_masks);
    dsp.init().context("Failed to initialize the engine")?;

    let running = Arc::new(AtomicBool::new(true));
    let clock = {
        let driver = Arc::clone(&driver);
        let running = Arc::clone(&running);
        let period = config.timing.frame_period();
        thread::Builder::new()
            .name("dspsync-sim-clock".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    if let Err(e) = driver.run_frame() {
                        log::error!("clock: Frame failed: {}", e);
                        break;
                    }
                    thread::sleep(period);
                }
            })
            .context("Failed to spawn clock thread")?
    };

    let tones: Vec<Arc<WaveBuffer>> = [440.0, 660.0, 880.0]
        .iter()
        .map(|&hz| Arc::new(WaveBuffer::new(sine(hz, FRAME_SAMPLES * 40), (FRAME_SAMPLES * 40) as u32)))
        .collect();
    let drone = Arc::new(WaveBuffer::new(sine(110.0, FRAME_SAMPLES * 8), (FRAME_SAMPLES * 8) as u32).looping());

    let melody = dsp.channel(0).context("channel 0")?;
    melody.set_format(SampleFormat::PCM16_MONO);
    melody.set_rate(SAMPLE_RATE);
    for tone in &tones {
        melody.wavebuf_add(Arc::clone(tone));
    }

    let bass = dsp.channel(1).context("channel 1")?;
    bass.set_rate(SAMPLE_RATE / 2.0);
    bass.set_mix([0.7, 0.7, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    bass.wavebuf_add(Arc::clone(&drone));

    let start = Instant::now();
    let total = Duration::from_secs(seconds);
    let mut slept = false;
    while start.elapsed() < total {
        thread::sleep(Duration::from_millis(250));
        log::info!(
            "sim: frames={} dropped={} melody seq={} playing={} bass pos={}",
            dsp.frame_count(),
            dsp.dropped_frames(),
            melody.wavebuf_seq(),
            melody.is_playing(),
            bass.sample_pos()
        );

        if !slept && start.elapsed() > total / 2 {
            slept = true;
            power_tx.send(PowerEvent::Sleep).context("power channel closed")?;
            thread::sleep(Duration::from_millis(50));
            power_tx.send(PowerEvent::Wakeup).context("power channel closed")?;
        }
        if let Some(fault) = dsp.fault() {
            bail!("sync thread stopped: {}", fault);
        }
    }

    let done = tones.iter().filter(|t| t.status() == WaveBufStatus::Done).count();
    log::info!("sim: {}/{} tones finished, drone {:?}", done, tones.len(), drone.status());

    dsp.exit();
    running.store(false, Ordering::Relaxed);
    if clock.join().is_err() {
        bail!("clock thread panicked");
    }
    Ok(())
}
