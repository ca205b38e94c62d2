//! Static transcode profile table and the GPU-mode codec downgrade rule.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub id: &'static str,
    pub label: &'static str,
    pub video_codec: &'static str,
    pub preset: &'static str,
    pub quality: u32,
}

pub const PROFILES: &[Profile] = &[
    Profile {
        id: "nvenc_max",
        label: "NVENC H.265 — Max kwaliteit",
        video_codec: "hevc_nvenc",
        preset: "p7",
        quality: 19,
    },
    Profile {
        id: "nvenc_high",
        label: "NVENC H.265 — Hoge kwaliteit",
        video_codec: "hevc_nvenc",
        preset: "p6",
        quality: 23,
    },
    Profile {
        id: "nvenc_balanced",
        label: "NVENC H.265 — Gebalanceerd",
        video_codec: "hevc_nvenc",
        preset: "p4",
        quality: 26,
    },
    Profile {
        id: "cpu_slow",
        label: "CPU H.265 — Max kwaliteit",
        video_codec: "libx265",
        preset: "slow",
        quality: 22,
    },
    Profile {
        id: "cpu_medium",
        label: "CPU H.265 — Gebalanceerd",
        video_codec: "libx265",
        preset: "medium",
        quality: 24,
    },
    Profile {
        id: "cpu_fast",
        label: "CPU H.265 — Snel",
        video_codec: "libx265",
        preset: "fast",
        quality: 26,
    },
    Profile {
        id: "h264_nvenc",
        label: "NVENC H.264 — Hoge kwaliteit",
        video_codec: "h264_nvenc",
        preset: "p6",
        quality: 20,
    },
    Profile {
        id: "h264_cpu",
        label: "CPU H.264 — Gebalanceerd",
        video_codec: "libx264",
        preset: "medium",
        quality: 22,
    },
];

const DEFAULT_PROFILE_ID: &str = "nvenc_max";

pub fn by_id(id: &str) -> Profile {
    PROFILES
        .iter()
        .find(|p| p.id == id)
        .copied()
        .unwrap_or_else(|| by_id(DEFAULT_PROFILE_ID))
}

/// The codec family a profile's `video_codec` targets ("hevc" or "h264"), used by the
/// scanner/watcher skip-if-already-this-codec check.
pub fn family(video_codec: &str) -> &'static str {
    if video_codec.contains("hevc") || video_codec.contains("265") {
        "hevc"
    } else {
        "h264"
    }
}

/// Applies the GPU-mode downgrade: an `*_nvenc` codec falls back to its CPU equivalent when
/// `gpu_mode` isn't `"nvidia"`. The profile id stored in settings is never rewritten — only the
/// codec actually passed to the encoder at dispatch time.
pub fn effective_codec(video_codec: &str, gpu_mode: &str) -> &'static str {
    let is_nvenc = video_codec.contains("nvenc");
    if is_nvenc && gpu_mode.eq_ignore_ascii_case("nvidia") {
        return static_codec(video_codec);
    }
    if is_nvenc {
        return if video_codec.contains("hevc") {
            "libx265"
        } else {
            "libx264"
        };
    }
    static_codec(video_codec)
}

fn static_codec(video_codec: &str) -> &'static str {
    PROFILES
        .iter()
        .find(|p| p.video_codec == video_codec)
        .map(|p| p.video_codec)
        .unwrap_or("libx265")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_id_falls_back_to_nvenc_max() {
        let p = by_id("does-not-exist");
        assert_eq!(p.id, "nvenc_max");
    }

    #[test]
    fn nvenc_downgrades_to_cpu_without_nvidia_gpu_mode() {
        assert_eq!(effective_codec("hevc_nvenc", "cpu"), "libx265");
        assert_eq!(effective_codec("h264_nvenc", "cpu"), "libx264");
        assert_eq!(effective_codec("hevc_nvenc", "nvidia"), "hevc_nvenc");
    }

    #[test]
    fn cpu_codec_is_unaffected_by_gpu_mode() {
        assert_eq!(effective_codec("libx265", "cpu"), "libx265");
        assert_eq!(effective_codec("libx265", "nvidia"), "libx265");
    }

    #[test]
    fn family_matches_codec_group() {
        assert_eq!(family("hevc_nvenc"), "hevc");
        assert_eq!(family("libx265"), "hevc");
        assert_eq!(family("h264_nvenc"), "h264");
        assert_eq!(family("libx264"), "h264");
    }
}
