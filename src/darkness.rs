//! Darkness windows from the sun's position.
//!
//! Evening and morning instants are found by solving the solar elevation equation for the
//! twilight class's depression angle, using the NOAA solar position approximations for the
//! sun's declination and the equation of time.

use chrono::{
    DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TwilightClass {
    Civil,
    Nautical,
    #[default]
    Astronomical,
}

impl TwilightClass {
    /// How far below the horizon the sun has to be for it to count as dark.
    pub fn depression_degrees(&self) -> f64 {
        match self {
            Self::Civil => 6.0,
            Self::Nautical => 12.0,
            Self::Astronomical => 18.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Civil => "civil",
            Self::Nautical => "nautical",
            Self::Astronomical => "astronomical",
        }
    }
}

impl fmt::Display for TwilightClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TwilightClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "civil" => Ok(Self::Civil),
            "nautical" => Ok(Self::Nautical),
            "astronomical" => Ok(Self::Astronomical),
            other => Err(format!(
                "Invalid twilight type: {other}. Must be one of: civil, nautical, astronomical"
            )),
        }
    }
}

/// One night's span of darkness, in wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct DarknessWindow {
    /// The evening the night starts on.
    pub date: NaiveDate,
    pub darkness_start: NaiveDateTime,
    pub darkness_end: NaiveDateTime,
    pub duration_hours: f64,
    pub twilight_class: TwilightClass,
}

impl DarknessWindow {
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        self.darkness_start <= now && now < self.darkness_end
    }

    /// `HH:MM - HH:MM`
    pub fn time_range_label(&self) -> String {
        format!(
            "{} - {}",
            self.darkness_start.format("%H:%M"),
            self.darkness_end.format("%H:%M")
        )
    }

    /// `Xh Ym`
    pub fn duration_label(&self) -> String {
        let total_minutes = (self.duration_hours * 60.0) as i64;
        format!("{}h {}m", total_minutes / 60, total_minutes % 60)
    }
}

/// The wall clock darkness instants are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WallClock {
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl WallClock {
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Self::Local => Local::now().naive_local(),
            Self::Fixed(offset) => Utc::now().with_timezone(offset).naive_local(),
        }
    }
}

/// The evening a night belongs to: before noon we are still in the previous evening's night.
pub fn evening_date_for(now: NaiveDateTime) -> NaiveDate {
    let today = now.date();
    if now.hour() < 12 {
        today.pred_opt().unwrap_or(today)
    } else {
        today
    }
}

/// Darkness window for the night starting on `evening`, in local time.
///
/// Returns `None` when the sun never gets deep enough below (or never rises back above) the
/// twilight class's depression angle, or when the offsets leave no time between start and end.
pub fn compute_window(
    latitude: f64,
    longitude: f64,
    evening: NaiveDate,
    twilight_class: TwilightClass,
    start_offset_minutes: i64,
    end_offset_minutes: i64,
) -> Option<DarknessWindow> {
    compute_window_on(
        WallClock::Local,
        latitude,
        longitude,
        evening,
        twilight_class,
        start_offset_minutes,
        end_offset_minutes,
    )
}

pub fn compute_window_on(
    clock: WallClock,
    latitude: f64,
    longitude: f64,
    evening: NaiveDate,
    twilight_class: TwilightClass,
    start_offset_minutes: i64,
    end_offset_minutes: i64,
) -> Option<DarknessWindow> {
    let offsets = (start_offset_minutes, end_offset_minutes);
    match clock {
        WallClock::Local => {
            compute_window_in(&Local, latitude, longitude, evening, twilight_class, offsets)
        }
        WallClock::Fixed(offset) => {
            compute_window_in(&offset, latitude, longitude, evening, twilight_class, offsets)
        }
    }
}

/// Darkness window with instants converted to `tz`'s wall clock.
pub fn compute_window_in<Tz: TimeZone>(
    tz: &Tz,
    latitude: f64,
    longitude: f64,
    evening: NaiveDate,
    twilight_class: TwilightClass,
    (start_offset_minutes, end_offset_minutes): (i64, i64),
) -> Option<DarknessWindow> {
    let depression = twilight_class.depression_degrees();
    let morning = evening.succ_opt()?;

    let start_utc = depression_crossing(latitude, longitude, evening, depression, Crossing::Dusk)?;
    let end_utc = depression_crossing(latitude, longitude, morning, depression, Crossing::Dawn)?;

    let darkness_start = shift_minutes(to_wall_clock(tz, start_utc), start_offset_minutes)?;
    let darkness_end = shift_minutes(to_wall_clock(tz, end_utc), end_offset_minutes)?;

    if darkness_end <= darkness_start {
        return None;
    }

    let duration_hours = (darkness_end - darkness_start).num_seconds() as f64 / 3600.0;

    Some(DarknessWindow {
        date: evening,
        darkness_start,
        darkness_end,
        duration_hours,
        twilight_class,
    })
}

fn shift_minutes(at: NaiveDateTime, minutes: i64) -> Option<NaiveDateTime> {
    at.checked_add_signed(Duration::try_minutes(minutes)?)
}

/// Tonight's window (or the current night's, before noon) in local time.
pub fn compute_tonight_window(
    latitude: f64,
    longitude: f64,
    twilight_class: TwilightClass,
    start_offset_minutes: i64,
    end_offset_minutes: i64,
) -> Option<DarknessWindow> {
    let evening = evening_date_for(Local::now().naive_local());
    compute_window(
        latitude,
        longitude,
        evening,
        twilight_class,
        start_offset_minutes,
        end_offset_minutes,
    )
}

/// Windows for several evenings; nights without darkness are left out.
pub fn compute_windows_for_dates(
    latitude: f64,
    longitude: f64,
    evenings: impl IntoIterator<Item = NaiveDate>,
    twilight_class: TwilightClass,
    start_offset_minutes: i64,
    end_offset_minutes: i64,
) -> Vec<DarknessWindow> {
    evenings
        .into_iter()
        .filter_map(|evening| {
            compute_window(
                latitude,
                longitude,
                evening,
                twilight_class,
                start_offset_minutes,
                end_offset_minutes,
            )
        })
        .collect()
}

fn to_wall_clock<Tz: TimeZone>(tz: &Tz, instant: DateTime<Utc>) -> NaiveDateTime {
    instant.with_timezone(tz).naive_local()
}

#[derive(Debug, Clone, Copy)]
enum Crossing {
    /// Sun sinking past the depression angle in the evening
    Dusk,
    /// Sun rising past it in the morning
    Dawn,
}

struct SolarPosition {
    declination: f64,
    equation_of_time_minutes: f64,
}

fn julian_century(instant: DateTime<Utc>) -> f64 {
    let julian_day = instant.timestamp() as f64 / 86_400.0 + 2_440_587.5;
    (julian_day - 2_451_545.0) / 36_525.0
}

fn solar_position(t: f64) -> SolarPosition {
    let mean_longitude = (280.46646 + t * (36000.76983 + t * 0.0003032)).rem_euclid(360.0);
    let mean_anomaly = (357.52911 + t * (35999.05029 - 0.0001537 * t)).to_radians();
    let eccentricity = 0.016708634 - t * (0.000042037 + 0.0000001267 * t);

    let center = mean_anomaly.sin() * (1.914602 - t * (0.004817 + 0.000014 * t))
        + (2.0 * mean_anomaly).sin() * (0.019993 - 0.000101 * t)
        + (3.0 * mean_anomaly).sin() * 0.000289;
    let true_longitude = mean_longitude + center;

    let omega = (125.04 - 1934.136 * t).to_radians();
    let apparent_longitude = (true_longitude - 0.00569 - 0.00478 * omega.sin()).to_radians();

    let mean_obliquity =
        23.0 + (26.0 + (21.448 - t * (46.815 + t * (0.00059 - t * 0.001813))) / 60.0) / 60.0;
    let obliquity = (mean_obliquity + 0.00256 * omega.cos()).to_radians();

    let declination = (obliquity.sin() * apparent_longitude.sin()).asin();

    let y = (obliquity / 2.0).tan().powi(2);
    let l0 = mean_longitude.to_radians();
    let equation_of_time = y * (2.0 * l0).sin() - 2.0 * eccentricity * mean_anomaly.sin()
        + 4.0 * eccentricity * y * mean_anomaly.sin() * (2.0 * l0).cos()
        - 0.5 * y * y * (4.0 * l0).sin()
        - 1.25 * eccentricity * eccentricity * (2.0 * mean_anomaly).sin();

    SolarPosition {
        declination,
        equation_of_time_minutes: 4.0 * equation_of_time.to_degrees(),
    }
}

/// The instant on `date` when the sun crosses `depression` degrees below the horizon.
fn depression_crossing(
    latitude: f64,
    longitude: f64,
    date: NaiveDate,
    depression: f64,
    crossing: Crossing,
) -> Option<DateTime<Utc>> {
    let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
    let latitude = latitude.to_radians();
    let elevation = (-depression).to_radians();

    // Start from the approximate local solar noon and refine against the event itself
    let mut estimate = midnight + Duration::minutes((720.0 - 4.0 * longitude) as i64);
    for _ in 0..3 {
        let sun = solar_position(julian_century(estimate));

        let cos_hour_angle = (elevation.sin() - latitude.sin() * sun.declination.sin())
            / (latitude.cos() * sun.declination.cos());
        if !(-1.0..=1.0).contains(&cos_hour_angle) {
            return None;
        }

        let hour_angle = cos_hour_angle.acos().to_degrees();
        let solar_noon = 720.0 - 4.0 * longitude - sun.equation_of_time_minutes;
        let minutes = match crossing {
            Crossing::Dusk => solar_noon + 4.0 * hour_angle,
            Crossing::Dawn => solar_noon - 4.0 * hour_angle,
        };

        estimate = midnight + Duration::milliseconds((minutes * 60_000.0).round() as i64);
    }

    Some(estimate)
}
