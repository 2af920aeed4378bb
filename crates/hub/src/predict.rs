//! Watering prediction: scores the latest sensor state against per-species
//! thresholds and decides whether, how much, and when to water.
//!
//! `predict` is a pure function; [`PredictionService`] wraps it with the
//! database reads an external API layer needs. Missing inputs (no reading,
//! no watering history) are explicit error values — the engine never
//! fabricates advice from absent data.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;

use crate::db::{Db, StoredReading};

/// Hours after which the time-since-watering score bottoms out.
const MAX_DRY_INTERVAL_HOURS: f64 = 48.0;

/// Fixed weight of the time score in the overall average.
const TIME_WEIGHT: f64 = 0.3;

/// Overall scores below this mean "water now".
const WATER_THRESHOLD: f64 = 0.6;

// ---------------------------------------------------------------------------
// Species reference data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ThresholdBand {
    pub min: f64,
    pub optimal: f64,
    pub max: f64,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct SpeciesProfile {
    pub soil_moisture: ThresholdBand,
    pub temperature: ThresholdBand,
    pub humidity: ThresholdBand,
    pub light: ThresholdBand,
    /// Baseline watering volume for a medium plant, millilitres.
    pub base_amount_ml: f64,
    /// Normal re-check interval under ideal conditions, hours.
    pub base_interval_hours: f64,
}

/// Read-only per-species threshold table. Unknown plant types fall back to
/// the default profile; lookup never fails.
pub struct SpeciesTable {
    profiles: HashMap<String, SpeciesProfile>,
    default: SpeciesProfile,
}

fn band(min: f64, optimal: f64, max: f64, weight: f64) -> ThresholdBand {
    ThresholdBand {
        min,
        optimal,
        max,
        weight,
    }
}

impl SpeciesTable {
    pub fn builtin() -> Self {
        let default = SpeciesProfile {
            soil_moisture: band(25.0, 55.0, 80.0, 1.5),
            temperature: band(12.0, 22.0, 32.0, 1.0),
            humidity: band(30.0, 55.0, 80.0, 0.8),
            light: band(800.0, 12_000.0, 30_000.0, 0.7),
            base_amount_ml: 250.0,
            base_interval_hours: 36.0,
        };

        let mut profiles = HashMap::new();
        profiles.insert(
            "succulent".to_string(),
            SpeciesProfile {
                soil_moisture: band(8.0, 20.0, 45.0, 1.6),
                temperature: band(15.0, 26.0, 35.0, 1.0),
                humidity: band(10.0, 30.0, 60.0, 0.6),
                light: band(2_000.0, 20_000.0, 50_000.0, 0.9),
                base_amount_ml: 120.0,
                base_interval_hours: 120.0,
            },
        );
        profiles.insert(
            "tropical".to_string(),
            SpeciesProfile {
                soil_moisture: band(35.0, 65.0, 85.0, 1.7),
                temperature: band(18.0, 26.0, 33.0, 1.0),
                humidity: band(50.0, 75.0, 95.0, 1.2),
                light: band(500.0, 8_000.0, 20_000.0, 0.7),
                base_amount_ml: 350.0,
                base_interval_hours: 24.0,
            },
        );
        profiles.insert(
            "herb".to_string(),
            SpeciesProfile {
                soil_moisture: band(30.0, 55.0, 75.0, 1.5),
                temperature: band(12.0, 21.0, 29.0, 1.0),
                humidity: band(35.0, 55.0, 75.0, 0.8),
                light: band(1_000.0, 15_000.0, 35_000.0, 0.8),
                base_amount_ml: 200.0,
                base_interval_hours: 24.0,
            },
        );
        profiles.insert(
            "flowering".to_string(),
            SpeciesProfile {
                soil_moisture: band(30.0, 60.0, 80.0, 1.6),
                temperature: band(14.0, 23.0, 30.0, 1.0),
                humidity: band(40.0, 60.0, 80.0, 0.9),
                light: band(1_500.0, 18_000.0, 40_000.0, 1.0),
                base_amount_ml: 280.0,
                base_interval_hours: 30.0,
            },
        );

        Self { profiles, default }
    }

    pub fn profile(&self, plant_type: &str) -> &SpeciesProfile {
        self.profiles
            .get(&plant_type.to_ascii_lowercase())
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlantSize {
    Small,
    Medium,
    Large,
}

impl PlantSize {
    pub fn multiplier(self) -> f64 {
        match self {
            PlantSize::Small => 0.5,
            PlantSize::Medium => 1.0,
            PlantSize::Large => 1.5,
        }
    }

    /// Unknown size strings fall back to medium.
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "small" => PlantSize::Small,
            "large" => PlantSize::Large,
            _ => PlantSize::Medium,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FactorScores {
    pub soil_moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<f64>,
    pub time: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub should_water: bool,
    /// Distance from the decision boundary, in [0, 1].
    pub confidence: f64,
    pub recommended_volume_ml: f64,
    pub hours_to_next_check: f64,
    /// Unix seconds.
    pub next_check_ts: i64,
    pub scores: FactorScores,
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("no sensor reading recorded for plant '{0}'")]
    MissingReading(String),
    #[error("no watering history for plant '{0}'")]
    MissingLastWatering(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Score one sensor value against its species band, in [0, 1].
///
/// Three-segment piecewise interpolation: proportional penalty below `min`,
/// proportional penalty above `max`, linear ramp 0.5→1.0 on [min, optimal)
/// and 1.0→0.5 on [optimal, max].
pub fn parameter_score(value: f64, band: &ThresholdBand) -> f64 {
    if value < band.min {
        if band.min <= 0.0 {
            return 0.0;
        }
        (value / band.min).clamp(0.0, 1.0)
    } else if value > band.max {
        if band.max <= 0.0 {
            return 0.0;
        }
        (1.0 - (value - band.max) / band.max).clamp(0.0, 1.0)
    } else if value < band.optimal {
        let span = band.optimal - band.min;
        if span <= 0.0 {
            return 1.0;
        }
        0.5 + 0.5 * (value - band.min) / span
    } else {
        let span = band.max - band.optimal;
        if span <= 0.0 {
            return 1.0;
        }
        1.0 - 0.5 * (value - band.optimal) / span
    }
}

fn time_score(hours_since_watering: f64) -> f64 {
    (1.0 - hours_since_watering.max(0.0) / MAX_DRY_INTERVAL_HOURS).max(0.0)
}

/// Pure watering decision over one reading plus the last actuation time.
///
/// Sensor fields absent from the reading are excluded from the weighted
/// average (their weight is not counted) rather than defaulted.
pub fn predict(
    reading: &StoredReading,
    last_watered_ts: i64,
    now: i64,
    plant_type: &str,
    size: PlantSize,
    table: &SpeciesTable,
) -> Prediction {
    let profile = table.profile(plant_type);

    let factors: [(Option<f64>, &ThresholdBand); 4] = [
        (reading.soil_moisture, &profile.soil_moisture),
        (reading.temperature, &profile.temperature),
        (reading.humidity, &profile.humidity),
        (reading.light, &profile.light),
    ];

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut scores = [None; 4];
    for (i, (value, band)) in factors.into_iter().enumerate() {
        if let Some(v) = value {
            let s = parameter_score(v, band);
            weighted_sum += s * band.weight;
            total_weight += band.weight;
            scores[i] = Some(s);
        }
    }

    let hours_since = (now - last_watered_ts) as f64 / 3600.0;
    let t_score = time_score(hours_since);
    weighted_sum += t_score * TIME_WEIGHT;
    total_weight += TIME_WEIGHT;

    let overall = weighted_sum / total_weight;

    let should_water = overall < WATER_THRESHOLD;
    let confidence = if should_water { 1.0 - overall } else { overall };

    // Volume scales up as the soil-moisture score degrades; a missing soil
    // reading contributes a neutral 0.5 here.
    let soil_score = scores[0].unwrap_or(0.5);
    let recommended_volume_ml =
        profile.base_amount_ml * size.multiplier() * (1.0 + (1.0 - soil_score) * 0.5);

    let hours_to_next_check = profile.base_interval_hours * overall;
    let next_check_ts = now + (hours_to_next_check * 3600.0) as i64;

    Prediction {
        should_water,
        confidence,
        recommended_volume_ml,
        hours_to_next_check,
        next_check_ts,
        scores: FactorScores {
            soil_moisture: scores[0],
            temperature: scores[1],
            humidity: scores[2],
            light: scores[3],
            time: t_score,
            overall,
        },
    }
}

// ---------------------------------------------------------------------------
// Service wrapper
// ---------------------------------------------------------------------------

/// Loads prediction inputs from storage for an external API layer.
#[derive(Clone)]
pub struct PredictionService {
    db: Db,
}

impl PredictionService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn predict_for_plant(
        &self,
        plant_id: &str,
        plant_type: &str,
        size: PlantSize,
        table: &SpeciesTable,
    ) -> Result<Prediction, PredictError> {
        let reading = self
            .db
            .latest_reading_for_plant(plant_id)
            .await?
            .ok_or_else(|| PredictError::MissingReading(plant_id.to_string()))?;

        let last_watered = self
            .db
            .last_actuation(&reading.device_id)
            .await?
            .ok_or_else(|| PredictError::MissingLastWatering(plant_id.to_string()))?;

        Ok(predict(
            &reading,
            last_watered,
            crate::db::now_unix(),
            plant_type,
            size,
            table,
        ))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn default_band() -> ThresholdBand {
        band(25.0, 55.0, 80.0, 1.5)
    }

    fn reading(
        soil: Option<f64>,
        temp: Option<f64>,
        humidity: Option<f64>,
        light: Option<f64>,
    ) -> StoredReading {
        StoredReading {
            device_id: "dev-1".into(),
            plant_id: Some("plant-1".into()),
            ts: 1_700_000_000,
            soil_moisture: soil,
            temperature: temp,
            humidity,
            light,
            water_level: None,
            battery: None,
        }
    }

    const HOUR: i64 = 3600;
    const NOW: i64 = 1_700_000_000;

    // -- parameter_score -------------------------------------------------

    #[test]
    fn score_at_optimal_is_one() {
        let b = default_band();
        assert_eq!(parameter_score(b.optimal, &b), 1.0);
    }

    #[test]
    fn score_at_min_and_max_is_half() {
        let b = default_band();
        assert!((parameter_score(b.min, &b) - 0.5).abs() < 1e-9);
        assert!((parameter_score(b.max, &b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn score_below_min_is_proportional() {
        let b = default_band();
        assert!((parameter_score(5.0, &b) - 5.0 / 25.0).abs() < 1e-9);
        assert_eq!(parameter_score(-10.0, &b), 0.0);
    }

    #[test]
    fn score_above_max_penalized_and_clamped() {
        let b = default_band();
        assert!((parameter_score(100.0, &b) - (1.0 - 20.0 / 80.0)).abs() < 1e-9);
        // Twice max and beyond bottoms out at zero.
        assert_eq!(parameter_score(500.0, &b), 0.0);
    }

    #[test]
    fn score_monotone_away_from_optimal_within_band() {
        let b = default_band();
        let mut prev = parameter_score(b.optimal, &b);
        let mut v = b.optimal;
        while v >= b.min {
            let s = parameter_score(v, &b);
            assert!(s <= prev + 1e-9, "score increased moving down at {v}");
            prev = s;
            v -= 1.0;
        }

        prev = parameter_score(b.optimal, &b);
        v = b.optimal;
        while v <= b.max {
            let s = parameter_score(v, &b);
            assert!(s <= prev + 1e-9, "score increased moving up at {v}");
            prev = s;
            v += 1.0;
        }
    }

    // -- time score ------------------------------------------------------

    #[test]
    fn time_score_caps_at_48_hours() {
        assert_eq!(time_score(0.0), 1.0);
        assert!((time_score(24.0) - 0.5).abs() < 1e-9);
        assert_eq!(time_score(48.0), 0.0);
        assert_eq!(time_score(90.0), 0.0);
    }

    // -- predict ---------------------------------------------------------

    #[test]
    fn bone_dry_plant_needs_water_with_high_confidence() {
        let table = SpeciesTable::builtin();
        // Soil far below min, temperature far above max, humidity below min,
        // 50 hours since the pump last ran.
        let r = reading(Some(2.0), Some(60.0), Some(5.0), None);
        let p = predict(&r, NOW - 50 * HOUR, NOW, "default", PlantSize::Medium, &table);

        assert!(p.should_water);
        assert!(p.confidence > 0.8, "confidence was {}", p.confidence);
    }

    #[test]
    fn ideal_conditions_need_no_water() {
        let table = SpeciesTable::builtin();
        let prof = table.profile("default");
        let r = reading(
            Some(prof.soil_moisture.optimal),
            Some(prof.temperature.optimal),
            Some(prof.humidity.optimal),
            Some(prof.light.optimal),
        );
        let p = predict(&r, NOW, NOW, "default", PlantSize::Medium, &table);

        assert!(!p.should_water);
        assert!((p.scores.overall - 1.0).abs() < 1e-9);
        assert!((p.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_plant_type_falls_back_to_default() {
        let table = SpeciesTable::builtin();
        let r = reading(Some(55.0), None, None, None);
        let p = predict(&r, NOW, NOW, "carnivorous-mystery", PlantSize::Medium, &table);

        // Default profile optimal soil moisture is 55 → full score.
        assert_eq!(p.scores.soil_moisture, Some(1.0));
    }

    #[test]
    fn missing_fields_excluded_from_average() {
        let table = SpeciesTable::builtin();
        let prof = table.profile("default");
        // Only soil moisture present, at optimal, freshly watered: overall
        // must still be 1.0 because absent factors carry no weight.
        let r = reading(Some(prof.soil_moisture.optimal), None, None, None);
        let p = predict(&r, NOW, NOW, "default", PlantSize::Medium, &table);

        assert!((p.scores.overall - 1.0).abs() < 1e-9);
        assert_eq!(p.scores.temperature, None);
    }

    #[test]
    fn volume_scales_with_dryness_and_size() {
        let table = SpeciesTable::builtin();
        let prof = table.profile("default");

        let dry = reading(Some(5.0), None, None, None);
        let wet = reading(Some(prof.soil_moisture.optimal), None, None, None);

        let p_dry = predict(&dry, NOW, NOW, "default", PlantSize::Medium, &table);
        let p_wet = predict(&wet, NOW, NOW, "default", PlantSize::Medium, &table);
        assert!(p_dry.recommended_volume_ml > p_wet.recommended_volume_ml);

        // Ideal soil → scale factor 1.0 → exactly the base amount.
        assert!((p_wet.recommended_volume_ml - prof.base_amount_ml).abs() < 1e-9);

        let p_large = predict(&wet, NOW, NOW, "default", PlantSize::Large, &table);
        assert!((p_large.recommended_volume_ml - prof.base_amount_ml * 1.5).abs() < 1e-9);
    }

    #[test]
    fn next_check_scales_with_overall_score() {
        let table = SpeciesTable::builtin();
        let prof = table.profile("default");
        let r = reading(
            Some(prof.soil_moisture.optimal),
            Some(prof.temperature.optimal),
            Some(prof.humidity.optimal),
            Some(prof.light.optimal),
        );
        let p = predict(&r, NOW, NOW, "default", PlantSize::Medium, &table);

        assert!((p.hours_to_next_check - prof.base_interval_hours).abs() < 1e-9);
        assert_eq!(
            p.next_check_ts,
            NOW + (prof.base_interval_hours * 3600.0) as i64
        );
    }

    #[test]
    fn plant_size_parse_lossy() {
        assert_eq!(PlantSize::parse_lossy("Small"), PlantSize::Small);
        assert_eq!(PlantSize::parse_lossy("LARGE"), PlantSize::Large);
        assert_eq!(PlantSize::parse_lossy("medium"), PlantSize::Medium);
        assert_eq!(PlantSize::parse_lossy("gigantic"), PlantSize::Medium);
    }

    // -- service preconditions -------------------------------------------

    async fn mem_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn service_reports_missing_reading() {
        let db = mem_db().await;
        let svc = PredictionService::new(db);
        let table = SpeciesTable::builtin();

        let err = svc
            .predict_for_plant("plant-1", "herb", PlantSize::Medium, &table)
            .await
            .unwrap_err();
        assert!(matches!(err, PredictError::MissingReading(_)));
    }

    #[tokio::test]
    async fn service_reports_missing_watering_history() {
        let db = mem_db().await;
        db.insert_reading(&reading(Some(40.0), None, None, None))
            .await
            .unwrap();

        let svc = PredictionService::new(db);
        let table = SpeciesTable::builtin();

        let err = svc
            .predict_for_plant("plant-1", "herb", PlantSize::Medium, &table)
            .await
            .unwrap_err();
        assert!(matches!(err, PredictError::MissingLastWatering(_)));
    }

    #[tokio::test]
    async fn service_happy_path() {
        let db = mem_db().await;
        db.insert_reading(&reading(Some(10.0), Some(20.0), None, None))
            .await
            .unwrap();
        db.insert_watering_event("dev-1", crate::db::now_unix() - 40 * HOUR, 10, "schedule")
            .await
            .unwrap();

        let svc = PredictionService::new(db);
        let table = SpeciesTable::builtin();

        let p = svc
            .predict_for_plant("plant-1", "tropical", PlantSize::Small, &table)
            .await
            .unwrap();
        assert!(p.should_water);
    }
}
