//! Encoder Argument Builder
//!
//! Derives the per-session encoder parameters once at start: input/output
//! frame rates, the bitrate plan and the full ffmpeg argv.

use pagecast_core::StreamConfig;

/// Minimum video bitrate for 1080p-class output, in kbps.
pub const FULL_HD_FLOOR_KBPS: u32 = 6000;
/// Minimum video bitrate for anything narrower than 1920 px, in kbps.
pub const DEFAULT_FLOOR_KBPS: u32 = 4000;

/// Below this input rate x264 can afford the slower `fast` preset.
const FAST_PRESET_BELOW_FPS: f64 = 5.0;

pub fn resolution_floor(width: u32) -> u32 {
    if width >= 1920 {
        FULL_HD_FLOOR_KBPS
    } else {
        DEFAULT_FLOOR_KBPS
    }
}

/// Video rate control values, all in kbps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitratePlan {
    pub target: u32,
    pub max: u32,
    pub buffer: u32,
    pub min: u32,
}

impl BitratePlan {
    pub fn derive(requested_kbps: u32, width: u32) -> Self {
        let target = requested_kbps.max(resolution_floor(width));
        let wide = u64::from(target);
        Self {
            target,
            max: clamp_u32(wide * 12 / 10),
            buffer: clamp_u32(wide * 2),
            min: clamp_u32(wide * 8 / 10),
        }
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Everything the encoder needs to know, fixed for the session's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderPlan {
    pub width: u32,
    pub height: u32,
    /// `1 / interval`, three decimals, exactly as passed on the command line.
    pub input_rate: String,
    pub output_fps: u32,
    pub preset: &'static str,
    pub bitrate: BitratePlan,
    output_url: String,
    stream_key: String,
}

impl EncoderPlan {
    pub fn new(config: &StreamConfig, ingest_url: &str, stream_key: &str) -> Self {
        let input_rate = config.input_frame_rate();
        let preset = if input_rate < FAST_PRESET_BELOW_FPS {
            "fast"
        } else {
            "veryfast"
        };
        Self {
            width: config.width,
            height: config.height,
            input_rate: format!("{input_rate:.3}"),
            output_fps: config.fps,
            preset,
            bitrate: BitratePlan::derive(config.bitrate_kbps, config.width),
            output_url: format!("{}/{}", ingest_url.trim_end_matches('/'), stream_key),
            stream_key: stream_key.to_string(),
        }
    }

    pub fn gop(&self) -> u32 {
        self.output_fps.saturating_mul(2)
    }

    /// Ingest URL with the stream key hidden, safe to log.
    pub fn redacted_url(&self) -> String {
        pagecast_logging::redact_secret(&self.output_url, Some(&self.stream_key))
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn args(&self) -> Vec<String> {
        let fps = self.output_fps.to_string();
        let b = &self.bitrate;
        let filter = format!(
            "fps={fps}:round=up,scale={}:{}:flags=lanczos,format=yuv420p",
            self.width, self.height
        );

        let mut args: Vec<String> = Vec::with_capacity(96);
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        // PNG frames on stdin
        push(&["-f", "image2pipe", "-vcodec", "png", "-r", &self.input_rate, "-i", "-"]);
        // silent audio; ingest endpoints reject video-only streams
        push(&["-f", "lavfi", "-i", "anullsrc=r=44100:cl=stereo"]);

        push(&[
            "-c:v", "libx264", "-preset", self.preset, "-tune", "zerolatency",
            "-pix_fmt", "yuv420p", "-profile:v", "high", "-level", "4.2",
        ]);
        push(&["-r", &fps, "-g", &self.gop().to_string(), "-keyint_min", &fps]);
        push(&[
            "-b:v", &format!("{}k", b.target),
            "-minrate", &format!("{}k", b.min),
            "-maxrate", &format!("{}k", b.max),
            "-bufsize", &format!("{}k", b.buffer),
            "-crf", "23",
        ]);
        push(&["-vf", &filter]);
        push(&[
            "-x264-params", "nal-hrd=cbr:force-cfr=1",
            "-sc_threshold", "0",
            "-flags", "+cgop+global_header",
            "-bf", "0", "-refs", "3", "-me_method", "hex", "-subq", "6", "-trellis", "1",
        ]);
        push(&[
            "-c:a", "aac", "-b:a", "160k", "-ar", "44100", "-ac", "2", "-profile:a", "aac_low",
        ]);
        push(&[
            "-f", "flv", "-flvflags", "no_duration_filesize",
            "-avoid_negative_ts", "make_zero", "-fflags", "+genpts",
            "-strict", "experimental",
        ]);
        push(&[&self.output_url]);
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(width: u32, bitrate_kbps: u32) -> StreamConfig {
        StreamConfig {
            width,
            bitrate_kbps,
            ..Default::default()
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> &'a str {
        let idx = args.iter().position(|a| a == flag).expect(flag);
        &args[idx + 1]
    }

    #[test]
    fn floor_depends_on_width() {
        assert_eq!(resolution_floor(1920), 6000);
        assert_eq!(resolution_floor(2560), 6000);
        assert_eq!(resolution_floor(1280), 4000);
    }

    #[test]
    fn bitrate_plan_never_below_floor() {
        for (width, requested) in [(1920, 2500), (1920, 9000), (1280, 100), (1280, 4500), (640, 0)] {
            let plan = BitratePlan::derive(requested, width);
            assert!(plan.target >= resolution_floor(width));
            assert_eq!(plan.max, plan.target * 12 / 10);
            assert_eq!(plan.buffer, plan.target * 2);
            assert_eq!(plan.min, plan.target * 8 / 10);
        }
    }

    #[test]
    fn bitrate_plan_rounds_down() {
        let plan = BitratePlan::derive(6001, 1920);
        assert_eq!(plan.max, 7201);
        assert_eq!(plan.min, 4800);
        assert_eq!(plan.buffer, 12002);
    }

    #[test]
    fn half_second_interval_gives_two_fps_input() {
        let config = StreamConfig {
            capture_interval_secs: 0.5,
            fps: 30,
            ..Default::default()
        };
        let plan = EncoderPlan::new(&config, "rtmp://ingest/live", "key");
        assert_eq!(plan.input_rate, "2.000");
        assert_eq!(plan.output_fps, 30);
        assert_eq!(plan.gop(), 60);
        assert_eq!(plan.preset, "fast");

        let args = plan.args();
        assert_eq!(value_after(&args, "-i"), "-");
        assert_eq!(value_after(&args, "-g"), "60");
        assert_eq!(value_after(&args, "-keyint_min"), "30");
    }

    #[test]
    fn fast_input_uses_veryfast_preset() {
        let config = StreamConfig {
            capture_interval_secs: 0.1,
            ..Default::default()
        };
        let plan = EncoderPlan::new(&config, "rtmp://ingest/live", "key");
        assert_eq!(plan.input_rate, "10.000");
        assert_eq!(plan.preset, "veryfast");
    }

    #[test]
    fn argv_carries_bitrate_plan_and_output() {
        let plan = EncoderPlan::new(&config(1280, 3000), "rtmp://a.rtmp.youtube.com/live2/", "abc-123");
        let args = plan.args();
        assert_eq!(value_after(&args, "-b:v"), "4000k");
        assert_eq!(value_after(&args, "-maxrate"), "4800k");
        assert_eq!(value_after(&args, "-minrate"), "3200k");
        assert_eq!(value_after(&args, "-bufsize"), "8000k");
        assert_eq!(
            value_after(&args, "-vf"),
            "fps=30:round=up,scale=1280:1080:flags=lanczos,format=yuv420p"
        );
        assert_eq!(args.last().unwrap(), "rtmp://a.rtmp.youtube.com/live2/abc-123");
        assert!(args.iter().any(|a| a == "anullsrc=r=44100:cl=stereo"));
    }

    #[test]
    fn redacted_url_hides_key() {
        let plan = EncoderPlan::new(&StreamConfig::default(), "rtmp://host/app", "secret-key");
        let shown = plan.redacted_url();
        assert!(!shown.contains("secret-key"), "{shown}");
        assert!(shown.starts_with("rtmp://host/app/"));
    }
}
