//! Catalog of the standard full-stack runs

use crate::error::{Error, Result};
use crate::net::LinkConfig;

use super::params::{Clip, ContentMode, FullStackTestParams, DEFAULT_DURATION_SECS};

/// Case names accepted by [`find`], in catalog order.
pub const NAMES: [&str; 11] = [
    "paris_qcif",
    "foreman_cif",
    "foreman_cif_plr5",
    "foreman_cif_500kbps",
    "foreman_cif_500kbps_limited_queue",
    "foreman_cif_500kbps_100ms",
    "foreman_cif_500kbps_100ms_limited_queue",
    "foreman_cif_1000kbps_100ms_limited_queue",
    "screenshare_slides_vp8_2tl",
    "screenshare_slides_vp8_2tl_scroll",
    "screenshare_slides_vp9_2tl",
];

fn foreman(label: &str, target_bitrate_bps: u32, link: LinkConfig) -> FullStackTestParams {
    FullStackTestParams {
        test_label: label.into(),
        clip: Clip::new("foreman_cif", 352, 288, 30),
        mode: ContentMode::RealTime,
        min_bitrate_bps: 30_000,
        target_bitrate_bps,
        max_bitrate_bps: 2_000_000,
        avg_psnr_threshold: 0.0,
        avg_ssim_threshold: 0.0,
        duration_secs: DEFAULT_DURATION_SECS,
        codec: "VP8".into(),
        link,
    }
}

fn slides(label: &str, clip: Clip, mode: ContentMode, codec: &str) -> FullStackTestParams {
    FullStackTestParams {
        test_label: label.into(),
        clip,
        mode,
        min_bitrate_bps: 50_000,
        target_bitrate_bps: 200_000,
        max_bitrate_bps: 2_000_000,
        avg_psnr_threshold: 0.0,
        avg_ssim_threshold: 0.0,
        duration_secs: DEFAULT_DURATION_SECS,
        codec: codec.into(),
        link: LinkConfig::default(),
    }
}

fn capped(queue_length_packets: usize, queue_delay_ms: i64, link_capacity_kbps: u32) -> LinkConfig {
    LinkConfig {
        queue_length_packets,
        queue_delay_ms,
        link_capacity_kbps,
        ..LinkConfig::default()
    }
}

pub fn find(name: &str) -> Result<FullStackTestParams> {
    let params = match name {
        "paris_qcif" => FullStackTestParams {
            test_label: "net_delay_0_0_plr_0".into(),
            clip: Clip::new("paris_qcif", 176, 144, 30),
            mode: ContentMode::RealTime,
            min_bitrate_bps: 300_000,
            target_bitrate_bps: 300_000,
            max_bitrate_bps: 300_000,
            avg_psnr_threshold: 36.0,
            avg_ssim_threshold: 0.96,
            duration_secs: DEFAULT_DURATION_SECS,
            codec: "VP8".into(),
            link: LinkConfig::default(),
        },
        "foreman_cif" => {
            let mut params = foreman("foreman_cif_net_delay_0_0_plr_0", 700_000, LinkConfig::default());
            params.min_bitrate_bps = 700_000;
            params.max_bitrate_bps = 700_000;
            params
        }
        "foreman_cif_plr5" => foreman(
            "foreman_cif_delay_50_0_plr_5",
            500_000,
            LinkConfig {
                loss_percent: 5,
                queue_delay_ms: 50,
                ..LinkConfig::default()
            },
        ),
        "foreman_cif_500kbps" => foreman("foreman_cif_500kbps", 500_000, capped(0, 0, 500)),
        "foreman_cif_500kbps_limited_queue" => foreman(
            "foreman_cif_500kbps_32pkts_queue",
            500_000,
            capped(32, 0, 500),
        ),
        "foreman_cif_500kbps_100ms" => {
            foreman("foreman_cif_500kbps_100ms", 500_000, capped(0, 100, 500))
        }
        "foreman_cif_500kbps_100ms_limited_queue" => foreman(
            "foreman_cif_500kbps_100ms_32pkts_queue",
            500_000,
            capped(32, 100, 500),
        ),
        "foreman_cif_1000kbps_100ms_limited_queue" => foreman(
            "foreman_cif_1000kbps_100ms_32pkts_queue",
            2_000_000,
            capped(32, 100, 1_000),
        ),
        "screenshare_slides_vp8_2tl" => slides(
            "screenshare_slides",
            Clip::new("screenshare_slides", 1850, 1110, 5),
            ContentMode::ScreenshareStatic,
            "VP8",
        ),
        // scrolls vertically only, the window is half the slide height
        "screenshare_slides_vp8_2tl_scroll" => slides(
            "screenshare_slides_scrolling",
            Clip::new("screenshare_slides_scrolling", 1850, 1110 / 2, 5),
            ContentMode::ScreenshareScrolling,
            "VP8",
        ),
        "screenshare_slides_vp9_2tl" => slides(
            "screenshare_slides_vp9_2tl",
            Clip::new("screenshare_slides", 1850, 1110, 5),
            ContentMode::ScreenshareStatic,
            "VP9",
        ),
        _ => return Err(Error::UnknownTestCase(name.to_string())),
    };
    Ok(params)
}

pub fn all() -> Vec<(&'static str, FullStackTestParams)> {
    NAMES
        .iter()
        .filter_map(|name| find(name).ok().map(|params| (*name, params)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VideoCodecType;

    #[test]
    fn catalog_is_complete_and_valid() {
        let cases = all();
        assert_eq!(cases.len(), NAMES.len());
        for (name, params) in &cases {
            params.validate().unwrap();
            params.codec_type().unwrap();
            assert!(
                params.min_bitrate_bps <= params.target_bitrate_bps
                    && params.target_bitrate_bps <= params.max_bitrate_bps,
                "{name}: bitrates out of order"
            );
        }
    }

    #[test]
    fn paris_has_the_only_quality_bar() {
        let paris = find("paris_qcif").unwrap();
        assert_eq!(paris.test_label, "net_delay_0_0_plr_0");
        assert_eq!(paris.avg_psnr_threshold, 36.0);
        assert_eq!(paris.avg_ssim_threshold, 0.96);
        assert_eq!(paris.frames_to_process(), 1_800);

        let others = all()
            .into_iter()
            .filter(|(name, _)| *name != "paris_qcif")
            .all(|(_, p)| p.avg_psnr_threshold == 0.0 && p.avg_ssim_threshold == 0.0);
        assert!(others);
    }

    #[test]
    fn link_profiles() {
        let plr = find("foreman_cif_plr5").unwrap();
        assert_eq!(plr.link.loss_percent, 5);
        assert_eq!(plr.link.queue_delay_ms, 50);

        let queue = find("foreman_cif_1000kbps_100ms_limited_queue").unwrap();
        assert_eq!(queue.link.queue_length_packets, 32);
        assert_eq!(queue.link.queue_delay_ms, 100);
        assert_eq!(queue.link.link_capacity_kbps, 1_000);
        assert_eq!(queue.target_bitrate_bps, 2_000_000);
    }

    #[test]
    fn screenshare_cases() {
        let scroll = find("screenshare_slides_vp8_2tl_scroll").unwrap();
        assert_eq!(scroll.mode, ContentMode::ScreenshareScrolling);
        assert_eq!((scroll.clip.width, scroll.clip.height), (1850, 555));

        let vp9 = find("screenshare_slides_vp9_2tl").unwrap();
        assert_eq!(vp9.codec_type().unwrap(), VideoCodecType::Vp9);
        assert_eq!(vp9.mode, ContentMode::ScreenshareStatic);
    }

    #[test]
    fn unknown_case() {
        assert!(matches!(find("foreman_qcif"), Err(Error::UnknownTestCase(_))));
    }
}
