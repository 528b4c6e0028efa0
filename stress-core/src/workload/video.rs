// stress-core/src/workload/video.rs
// Video stress: looped hardware encodes of a synthetic source through ffmpeg

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DomainCounters, DomainExit};
use crate::error::*;
use crate::stress_error;
use crate::tuning::VideoTuning;

/// Pause before retrying after ffmpeg failed to start
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// First configured encoder that appears in `ffmpeg -encoders` output
pub fn select_encoder<'a>(listing: &str, preferred: &'a [String]) -> Option<&'a str> {
    preferred
        .iter()
        .find(|name| {
            listing
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(name.as_str()))
        })
        .map(String::as_str)
}

pub struct VideoStress {
    tuning: VideoTuning,
    encoder: Option<String>,
}

impl VideoStress {
    pub fn new(tuning: VideoTuning) -> Self {
        Self { tuning, encoder: None }
    }

    /// Checks that ffmpeg runs and offers one of the hardware encoders
    pub async fn prepare(&mut self) -> Result<()> {
        let output = Command::new(&self.tuning.ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| stress_error!(unavailable, "ffmpeg", e))?;
        if !output.status.success() {
            return Err(stress_error!(unavailable, "ffmpeg", format!("exited with {}", output.status)));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let encoder = select_encoder(&listing, &self.tuning.encoders).ok_or_else(|| {
            stress_error!(
                unavailable,
                "video encoder",
                format!("none of [{}] available", self.tuning.encoders.join(", "))
            )
        })?;
        info!("🎬 Video stress using encoder {}", encoder);
        self.encoder = Some(encoder.to_string());
        Ok(())
    }

    fn encode_args(&self, encoder: &str) -> Vec<String> {
        let source = format!(
            "testsrc=size={}x{}:rate=30",
            self.tuning.width, self.tuning.height
        );
        let seconds = self.tuning.seconds_per_cycle.to_string();
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostdin",
            "-f",
            "lavfi",
            "-i",
            source.as_str(),
            "-t",
            seconds.as_str(),
            "-c:v",
            encoder,
            "-f",
            "null",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// One encode per cycle. The child is killed as soon as `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken, counters: Arc<DomainCounters>) -> DomainExit {
        if self.encoder.is_none() {
            if let Err(e) = self.prepare().await {
                return DomainExit::Abnormal(e.to_string());
            }
        }
        let encoder = self.encoder.clone().unwrap_or_default();
        let args = self.encode_args(&encoder);
        let limit = self.tuning.spawn_failure_limit.max(1);
        let mut spawn_failures = 0u32;
        let mut cycle = 0u64;

        while !cancel.is_cancelled() {
            let mut child = match Command::new(&self.tuning.ffmpeg)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => {
                    spawn_failures = 0;
                    child
                }
                Err(e) => {
                    spawn_failures += 1;
                    counters.record_failure("spawn", cycle, 1, &stress_error!(io, "ffmpeg spawn", e));
                    if spawn_failures >= limit {
                        return DomainExit::Abnormal(format!("ffmpeg failed to start {} times in a row", spawn_failures));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(SPAWN_RETRY_DELAY) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => {
                        counters.add_operations(1);
                        counters.add_bytes(self.frame_bytes());
                    }
                    Ok(status) => {
                        counters.record_incident("encode", cycle, format!("encoder exited with {}", status));
                    }
                    Err(e) => {
                        counters.record_incident("encode", cycle, format!("waiting for encoder failed: {}", e));
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("Cancelling encode cycle {}", cycle);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill encoder: {}", e);
                    }
                    break;
                }
            }
            cycle += 1;
        }

        debug!("Video stress stopped after {} cycles", cycle);
        DomainExit::Completed
    }

    /// Raw frame bytes fed through one cycle (NV12-equivalent)
    fn frame_bytes(&self) -> u64 {
        let per_frame = self.tuning.width as u64 * self.tuning.height as u64 * 3 / 2;
        per_frame * 30 * self.tuning.seconds_per_cycle as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Domain;

    const ENCODERS: &str = "Encoders:
 V..... = Video
 ------
 V....D h264_v4l2m2m         V4L2 mem2mem H.264 encoder wrapper (codec h264)
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (codec h264)
";

    #[test]
    fn test_select_encoder_falls_back() {
        let preferred = vec!["hevc_v4l2m2m".to_string(), "h264_v4l2m2m".to_string()];
        assert_eq!(select_encoder(ENCODERS, &preferred), Some("h264_v4l2m2m"));
        assert_eq!(select_encoder("", &preferred), None);
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_unavailable() {
        let mut video = VideoStress::new(VideoTuning {
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            ..VideoTuning::default()
        });
        let err = video.prepare().await.unwrap_err();
        assert!(matches!(err, StressError::CapabilityUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_repeated_spawn_failures_are_abnormal() {
        let video = VideoStress {
            tuning: VideoTuning {
                ffmpeg: "/nonexistent/ffmpeg".to_string(),
                ..VideoTuning::default()
            },
            encoder: Some("h264_v4l2m2m".to_string()),
        };
        let counters = Arc::new(DomainCounters::new(Domain::Video, 8));
        let exit = video.run(CancellationToken::new(), counters.clone()).await;

        assert!(matches!(exit, DomainExit::Abnormal(_)));
        assert_eq!(counters.errors(), 3);
    }

    #[tokio::test]
    async fn test_spawn_retries_are_spaced_out() {
        let video = VideoStress {
            tuning: VideoTuning {
                ffmpeg: "/nonexistent/ffmpeg".to_string(),
                spawn_failure_limit: 3,
                ..VideoTuning::default()
            },
            encoder: Some("h264_v4l2m2m".to_string()),
        };
        let counters = Arc::new(DomainCounters::new(Domain::Video, 8));
        let started = std::time::Instant::now();
        video.run(CancellationToken::new(), counters.clone()).await;

        // Two pauses between three attempts
        assert!(started.elapsed() >= SPAWN_RETRY_DELAY * 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_spawn_backoff() {
        let video = VideoStress {
            tuning: VideoTuning {
                ffmpeg: "/nonexistent/ffmpeg".to_string(),
                spawn_failure_limit: 1000,
                ..VideoTuning::default()
            },
            encoder: Some("h264_v4l2m2m".to_string()),
        };
        let counters = Arc::new(DomainCounters::new(Domain::Video, 8));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(video.run(cancel.clone(), counters.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();

        assert_eq!(exit, DomainExit::Completed);
        assert_eq!(counters.errors(), 1);
    }
}
