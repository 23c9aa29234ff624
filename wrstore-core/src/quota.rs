//! Quota-exhaustion date projection from a group's history series.
//!
//! The projection fits a least-squares line through the series (usage
//! against days since the first point) and solves for the day the line
//! crosses the current quota. Size and inode axes project independently.

use chrono::NaiveDate;

use crate::basedirs::HistoryPoint;

/// The zero value stored in date columns when no projection applies.
pub const ZERO_DATE: NaiveDate = match NaiveDate::from_ymd_opt(1970, 1, 1) {
    Some(d) => d,
    None => panic!("epoch date"),
};

/// Projected exhaustion dates for one group. `None` means the projection's
/// preconditions were not met (no quota, shrinking usage, or too little
/// history) and the zero date is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaProjection {
    pub date_no_space: Option<NaiveDate>,
    pub date_no_files: Option<NaiveDate>,
}

/// Project both exhaustion dates from an append-ordered history series.
pub fn date_quota_full(series: &[HistoryPoint]) -> QuotaProjection {
    QuotaProjection {
        date_no_space: project_axis(series, |p| p.usage_size, |p| p.quota_size),
        date_no_files: project_axis(series, |p| p.usage_inodes, |p| p.quota_inodes),
    }
}

fn project_axis(
    series: &[HistoryPoint],
    usage: impl Fn(&HistoryPoint) -> u64,
    quota: impl Fn(&HistoryPoint) -> u64,
) -> Option<NaiveDate> {
    let last = series.last()?;
    let quota_now = quota(last);
    if quota_now == 0 {
        return None;
    }

    if usage(last) >= quota_now {
        return Some(last.date);
    }

    if series.len() < 2 {
        return None;
    }

    let first_date = series.first()?.date;
    let points: Vec<(f64, f64)> = series
        .iter()
        .map(|p| {
            let day = (p.date - first_date).num_days() as f64;
            (day, usage(p) as f64)
        })
        .collect();

    let (slope, intercept) = least_squares(&points)?;
    if slope <= 0.0 {
        return None;
    }

    let crossing_day = (quota_now as f64 - intercept) / slope;
    if !crossing_day.is_finite() {
        return None;
    }

    let days = crossing_day.ceil().max(0.0);
    // num_days fits i64 for any sane projection; cap to keep the date valid
    let days = days.min(365.0 * 10_000.0) as i64;
    let projected = first_date.checked_add_days(chrono::Days::new(days as u64))?;

    // Never project into the past relative to the observed series
    Some(projected.max(last.date))
}

/// Least-squares fit of y = slope * x + intercept. `None` when every x is
/// identical (vertical series).
fn least_squares(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn point(d: u32, usage_size: u64, quota_size: u64) -> HistoryPoint {
        HistoryPoint {
            date: day(d),
            usage_size,
            quota_size,
            usage_inodes: 0,
            quota_inodes: 0,
        }
    }

    #[test]
    fn test_empty_series() {
        assert_eq!(date_quota_full(&[]), QuotaProjection::default());
    }

    #[test]
    fn test_single_point_no_projection() {
        let p = date_quota_full(&[point(1, 10, 100)]);
        assert_eq!(p.date_no_space, None);
    }

    #[test]
    fn test_zero_quota() {
        let series = [point(1, 10, 0), point(2, 20, 0)];
        assert_eq!(date_quota_full(&series).date_no_space, None);
    }

    #[test]
    fn test_already_exhausted_projects_last_date() {
        let series = [point(1, 50, 100), point(10, 120, 100)];
        assert_eq!(date_quota_full(&series).date_no_space, Some(day(10)));
    }

    #[test]
    fn test_linear_growth_crosses_quota() {
        // 10 units/day from 10: quota 100 crossed on day offset 9 -> Mar 10
        let series = [point(1, 10, 100), point(2, 20, 100), point(3, 30, 100)];
        let projected = date_quota_full(&series).date_no_space.unwrap();
        assert_eq!(projected, day(10));
    }

    #[test]
    fn test_flat_usage_never_exhausts() {
        let series = [point(1, 10, 100), point(2, 10, 100), point(3, 10, 100)];
        assert_eq!(date_quota_full(&series).date_no_space, None);
    }

    #[test]
    fn test_shrinking_usage_never_exhausts() {
        let series = [point(1, 90, 100), point(2, 50, 100), point(3, 10, 100)];
        assert_eq!(date_quota_full(&series).date_no_space, None);
    }

    #[test]
    fn test_projection_not_before_last_observation() {
        // Steep early growth then recent plateau still fits a positive
        // slope; the projection may mathematically land inside the series
        // and is clamped to the newest observation.
        let series = [
            point(1, 10, 40),
            point(2, 30, 40),
            point(3, 39, 40),
            point(20, 39, 40),
        ];
        if let Some(d) = date_quota_full(&series).date_no_space {
            assert!(d >= day(20));
        }
    }

    #[test]
    fn test_inode_axis_independent() {
        let series = [
            HistoryPoint {
                date: day(1),
                usage_size: 10,
                quota_size: 0,
                usage_inodes: 10,
                quota_inodes: 100,
            },
            HistoryPoint {
                date: day(2),
                usage_size: 10,
                quota_size: 0,
                usage_inodes: 20,
                quota_inodes: 100,
            },
        ];
        let p = date_quota_full(&series);
        assert_eq!(p.date_no_space, None);
        assert_eq!(p.date_no_files, Some(day(10)));
    }

    #[test]
    fn test_deterministic() {
        let series = [point(1, 10, 100), point(2, 23, 100), point(5, 47, 100)];
        assert_eq!(date_quota_full(&series), date_quota_full(&series));
    }
}
