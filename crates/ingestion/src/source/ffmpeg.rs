//! FFmpeg-backed source for RTSP/HLS/DASH/SIP transports.
//!
//! Decoding runs on a dedicated thread; decoded 16 kHz mono s16le blocks
//! flow to the async side through a bounded channel.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::AudioSource;

pub struct FfmpegSource {
    rx: mpsc::Receiver<anyhow::Result<Vec<u8>>>,
}

impl FfmpegSource {
    pub fn open(url: &str) -> anyhow::Result<Self> {
        ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg init failed: {}", e))?;

        let (tx, rx) = mpsc::channel(32);
        let url = url.to_string();
        std::thread::Builder::new()
            .name("ffmpeg-decode".into())
            .spawn(move || decode_loop(&url, tx))
            .map_err(|e| anyhow::anyhow!("failed to spawn decode thread: {}", e))?;

        Ok(Self { rx })
    }
}

#[async_trait]
impl AudioSource for FfmpegSource {
    async fn next_block(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        match self.rx.recv().await {
            Some(Ok(block)) => Ok(Some(block)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        // Dropping the receiver makes the decode thread's next send fail
        // and unwind its loop.
        self.rx.close();
    }
}

fn decode_loop(url: &str, tx: mpsc::Sender<anyhow::Result<Vec<u8>>>) {
    use ffmpeg_next as ff;

    let result = (|| -> anyhow::Result<()> {
        let mut ictx = ff::format::input(&url)
            .map_err(|e| anyhow::anyhow!("failed to open '{}': {}", url, e))?;
        let input = ictx
            .streams()
            .best(ff::media::Type::Audio)
            .ok_or_else(|| anyhow::anyhow!("no audio stream in '{}'", url))?;
        let stream_index = input.index();

        let context = ff::codec::context::Context::from_parameters(input.parameters())?;
        let mut decoder = context.decoder().audio()?;

        let mut resampler = ff::software::resampling::context::Context::get(
            decoder.format(),
            decoder.channel_layout(),
            decoder.rate(),
            ff::format::Sample::I16(ff::format::sample::Type::Packed),
            ff::channel_layout::ChannelLayout::MONO,
            16_000,
        )?;

        debug!(url, "ffmpeg source opened");

        let mut decoded = ff::frame::Audio::empty();
        for (stream, packet) in ictx.packets() {
            if stream.index() != stream_index {
                continue;
            }
            decoder.send_packet(&packet)?;
            while decoder.receive_frame(&mut decoded).is_ok() {
                let mut resampled = ff::frame::Audio::empty();
                resampler.run(&decoded, &mut resampled)?;
                let bytes_per_sample = 2;
                let len = resampled.samples() * bytes_per_sample;
                if len == 0 {
                    continue;
                }
                let block = resampled.data(0)[..len].to_vec();
                if tx.blocking_send(Ok(block)).is_err() {
                    // Consumer gone; stop decoding.
                    return Ok(());
                }
            }
        }

        decoder.send_eof()?;
        while decoder.receive_frame(&mut decoded).is_ok() {
            let mut resampled = ff::frame::Audio::empty();
            resampler.run(&decoded, &mut resampled)?;
            let len = resampled.samples() * 2;
            if len > 0 && tx.blocking_send(Ok(resampled.data(0)[..len].to_vec())).is_err() {
                return Ok(());
            }
        }
        Ok(())
    })();

    if let Err(err) = result {
        warn!(url, error = %err, "ffmpeg decode loop failed");
        let _ = tx.blocking_send(Err(err));
    }
}
