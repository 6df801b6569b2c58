//! Source-independent normalization helpers: product-name timestamps, platform,
//! track checks, and footprint geometry.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use geo::{BoundingRect, Geometry};
use regex::Regex;
use s1acq_core::TrackConstants;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use wkt::TryFromWkt;

static PRODUCT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<spacecraft>S1[A-Za-z0-9_])_[A-Za-z0-9_]{2}_SLC__(?P<misc>.*?)_(?P<s_date>[0-9]{8})T(?P<s_time>[0-9]{6})_(?P<e_date>[0-9]{8})T(?P<e_time>[0-9]{6})",
    )
    .expect("valid product name regex")
});

static PLATFORM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"S1(.+?)_").expect("valid platform regex"));

static DATA_TAKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_[0-9]{6}_(?P<take>[0-9A-F]{6})_[0-9A-F]{4}$").expect("valid data take regex")
});

#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("raw record is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has an invalid value: {value}")]
    InvalidField { field: String, value: String },
    #[error("failed to recognize orbit direction: {0}")]
    UnknownDirection(String),
    #[error("product name does not match the SLC naming pattern: {0}")]
    ProductName(String),
    #[error("unparsable timestamp `{value}` in `{field}`")]
    Timestamp { field: &'static str, value: String },
    #[error("failed to extract platform from {0}")]
    Platform(String),
    #[error("invalid footprint `{footprint}`: {message}")]
    Footprint { footprint: String, message: String },
}

/// Accepts `2015-09-09T16:37:11.561Z`, offsets, or a naive timestamp with or without fraction.
pub fn parse_catalog_time(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f").ok()
}

pub fn parse_catalog_utc(value: &str) -> Option<DateTime<Utc>> {
    parse_catalog_time(value).map(|naive| Utc.from_utc_datetime(&naive))
}

/// `.<micros with trailing zeros stripped, at least 3 digits>Z`
fn fraction_suffix(ts: &NaiveDateTime) -> String {
    let micros = format!("{:06}", ts.nanosecond() % 1_000_000_000 / 1_000);
    let trimmed = micros.trim_end_matches('0');
    format!(".{trimmed:0<3}Z")
}

/// `YYYYMMDD` + `HHMMSS` to `YYYY-MM-DDTHH:MM:SS`.
fn split_compact(title: &str, date: &str, time: &str) -> Result<String, NormalizationError> {
    let part = |value: &str, a: usize, b: usize| {
        value
            .get(a..b)
            .map(str::to_string)
            .ok_or_else(|| NormalizationError::ProductName(title.to_string()))
    };
    Ok(format!(
        "{}-{}-{}T{}:{}:{}",
        part(date, 0, 4)?,
        part(date, 4, 6)?,
        part(date, 6, 8)?,
        part(time, 0, 2)?,
        part(time, 2, 4)?,
        part(time, 4, 6)?
    ))
}

/// Sensing bounds: date and whole seconds from the product name, sub-second
/// fraction from the catalog values.
pub fn get_accurate_times(
    title: &str,
    start: &str,
    stop: &str,
) -> Result<(String, String), NormalizationError> {
    let caps = PRODUCT_NAME_RE
        .captures(title)
        .ok_or_else(|| NormalizationError::ProductName(title.to_string()))?;
    let catalog_start = parse_catalog_time(start).ok_or_else(|| NormalizationError::Timestamp {
        field: "sensingStart",
        value: start.to_string(),
    })?;
    let catalog_stop = parse_catalog_time(stop).ok_or_else(|| NormalizationError::Timestamp {
        field: "sensingStop",
        value: stop.to_string(),
    })?;

    let file_start = split_compact(title, &caps["s_date"], &caps["s_time"])?;
    let file_stop = split_compact(title, &caps["e_date"], &caps["e_time"])?;

    let catalog_start_secs = catalog_start.format("%Y-%m-%dT%H:%M:%S").to_string();
    let catalog_stop_secs = catalog_stop.format("%Y-%m-%dT%H:%M:%S").to_string();
    if catalog_start_secs != file_start {
        warn!(title, file = %file_start, catalog = %catalog_start_secs, "start timestamp mismatch");
    }
    if catalog_stop_secs != file_stop {
        warn!(title, file = %file_stop, catalog = %catalog_stop_secs, "end timestamp mismatch");
    }

    Ok((
        format!("{file_start}{}", fraction_suffix(&catalog_start)),
        format!("{file_stop}{}", fraction_suffix(&catalog_stop)),
    ))
}

pub fn platform_from_title(title: &str) -> Result<String, NormalizationError> {
    PLATFORM_RE
        .captures(title)
        .map(|caps| format!("Sentinel-1{}", &caps[1]))
        .ok_or_else(|| NormalizationError::Platform(title.to_string()))
}

/// Mission data-take ID from the hex field of a product name, in decimal.
pub fn data_take_from_title(title: &str) -> Option<String> {
    let caps = DATA_TAKE_RE.captures(title)?;
    u64::from_str_radix(&caps["take"], 16)
        .ok()
        .map(|take| take.to_string())
}

/// Logs a warning when the relative orbit does not follow from the absolute orbit.
pub fn verify_track(platform: &str, orbit_number: i64, track_number: i64) -> bool {
    let Some(constants) = TrackConstants::for_platform(platform) else {
        return true;
    };
    let expected = constants.expected_track(orbit_number);
    if expected != track_number {
        warn!(
            platform,
            orbit = orbit_number,
            track = track_number,
            expected,
            "failed to verify relative orbit number against track number"
        );
        return false;
    }
    true
}

#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    pub location: JsonValue,
    pub bbox: Vec<[f64; 2]>,
}

fn footprint_error(footprint: &str, message: impl ToString) -> NormalizationError {
    NormalizationError::Footprint {
        footprint: footprint.to_string(),
        message: message.to_string(),
    }
}

pub fn parse_footprint(footprint: &str) -> Result<Footprint, NormalizationError> {
    let geometry = Geometry::<f64>::try_from_wkt_str(footprint)
        .map_err(|e| footprint_error(footprint, e))?;
    let rect = geometry
        .bounding_rect()
        .ok_or_else(|| footprint_error(footprint, "empty geometry"))?;

    let location = serde_json::to_value(geojson::Geometry::new(geojson::Value::from(&geometry)))
        .map_err(|e| footprint_error(footprint, e))?;

    let (min, max) = (rect.min(), rect.max());
    let bbox = vec![
        [min.x, min.y],
        [max.x, min.y],
        [max.x, max.y],
        [min.x, max.y],
        [min.x, min.y],
    ];
    Ok(Footprint { location, bbox })
}

fn ring_area(ring: &[[f64; 2]]) -> f64 {
    let n = ring.len();
    let mut area = 0.0;
    for i in 0..n {
        let j = (i + 1) % n;
        area += ring[i][1] * ring[j][0];
        area -= ring[j][1] * ring[i][0];
    }
    area / 2.0
}

/// Drops a doubled closing point, then winds the ring clockwise with latitude
/// on the horizontal axis (counter-clockwise in lon/lat, as the catalog's
/// geo_shape mapping expects).
pub fn orient_for_catalog(mut ring: Vec<[f64; 2]>) -> Vec<[f64; 2]> {
    let n = ring.len();
    if n >= 2 && ring[n - 1] == ring[n - 2] {
        ring.pop();
    }
    if ring_area(&ring) > 0.0 {
        ring.reverse();
    }
    ring
}

/// Applies `orient_for_catalog` to the exterior ring of a GeoJSON polygon.
pub fn orient_polygon_location(location: &mut JsonValue) {
    if location.get("type").and_then(JsonValue::as_str) != Some("Polygon") {
        return;
    }
    let Some(exterior) = location
        .get_mut("coordinates")
        .and_then(|c| c.get_mut(0))
    else {
        return;
    };
    let ring: Option<Vec<[f64; 2]>> = serde_json::from_value(exterior.clone()).ok();
    if let Some(ring) = ring {
        *exterior = serde_json::json!(orient_for_catalog(ring));
    }
}

/// Integer fields arrive as numbers or numeric strings depending on the source.
pub fn json_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn json_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TITLE: &str = "S1A_IW_SLC__1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D";

    #[test]
    fn accurate_times_keep_filename_seconds_and_catalog_fraction() {
        let (start, stop) = get_accurate_times(
            TITLE,
            "2015-09-09T16:37:11.561Z",
            "2015-09-09T16:37:46.345678",
        )
        .unwrap();
        assert_eq!(start, "2015-09-09T16:37:11.561Z");
        assert_eq!(stop, "2015-09-09T16:37:46.345678Z");
    }

    #[test]
    fn accurate_times_pad_fraction_to_milliseconds() {
        let (start, stop) =
            get_accurate_times(TITLE, "2015-09-09T16:37:11", "2015-09-09T16:37:46.5").unwrap();
        assert_eq!(start, "2015-09-09T16:37:11.000Z");
        assert_eq!(stop, "2015-09-09T16:37:46.500Z");
    }

    #[test]
    fn accurate_times_prefer_filename_when_seconds_disagree() {
        let (start, _) = get_accurate_times(
            TITLE,
            "2015-09-09T16:37:12.250Z",
            "2015-09-09T16:37:46.000Z",
        )
        .unwrap();
        assert_eq!(start, "2015-09-09T16:37:11.250Z");
    }

    #[test]
    fn non_slc_product_name_is_rejected() {
        let err = get_accurate_times(
            "S1A_IW_GRDH_1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D",
            "2015-09-09T16:37:11Z",
            "2015-09-09T16:37:46Z",
        )
        .unwrap_err();
        assert!(matches!(err, NormalizationError::ProductName(_)));
    }

    #[test]
    fn non_ascii_digits_in_product_name_are_rejected() {
        let err = get_accurate_times(
            "S1A_IW_SLC__1SDV_\u{967}\u{966}\u{967}\u{96B}0909T163711_20150909T163746_007640_00A97E_A69D",
            "2015-09-09T16:37:11Z",
            "2015-09-09T16:37:46Z",
        )
        .unwrap_err();
        assert!(matches!(err, NormalizationError::ProductName(_)));
        assert!(split_compact(TITLE, "2015\u{966}909", "163711").is_err());
    }

    #[test]
    fn platform_and_data_take_come_from_title() {
        assert_eq!(platform_from_title(TITLE).unwrap(), "Sentinel-1A");
        assert_eq!(data_take_from_title(TITLE).as_deref(), Some("43390"));
        assert!(platform_from_title("ENVISAT_ASAR").is_err());
    }

    #[test]
    fn track_mismatch_only_reports() {
        assert!(verify_track("Sentinel-1A", 7640, 43));
        assert!(!verify_track("Sentinel-1A", 7640, 44));
        assert!(verify_track("Sentinel-2A", 7640, 1));
    }

    #[test]
    fn footprint_yields_geojson_and_envelope() {
        let fp = parse_footprint(
            "POLYGON ((-118.4 34.2,-115.7 34.6,-115.4 33.0,-118.1 32.6,-118.4 34.2))",
        )
        .unwrap();
        assert_eq!(fp.location["type"], "Polygon");
        assert_eq!(fp.location["coordinates"][0][1][0], -115.7);
        assert_eq!(
            fp.bbox,
            vec![
                [-118.4, 32.6],
                [-115.4, 32.6],
                [-115.4, 34.6],
                [-118.4, 34.6],
                [-118.4, 32.6]
            ]
        );
        assert!(parse_footprint("POLYGON ((-118.4 34.2,").is_err());
    }

    #[test]
    fn catalog_orientation_reverses_clockwise_lon_lat_ring() {
        let ring = vec![
            [-118.4, 34.2],
            [-115.7, 34.6],
            [-115.4, 33.0],
            [-118.1, 32.6],
            [-118.4, 34.2],
        ];
        let oriented = orient_for_catalog(ring.clone());
        assert_eq!(oriented[1], [-118.1, 32.6]);
        assert_eq!(orient_for_catalog(oriented.clone()), oriented);

        let mut doubled = ring;
        doubled.push([-118.4, 34.2]);
        assert_eq!(orient_for_catalog(doubled).len(), 5);
    }
}
