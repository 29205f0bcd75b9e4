//! Sechsachsen-Fusion
//!
//! Der [`MotionProcessor`] gehört genau einem Gerät und wird einmal pro
//! gelesenem Report aufgerufen. Er korrigiert den Gyro-Bias, integriert die
//! Orientierung, verfolgt die Schwerkraft per Komplementärfilter und liefert
//! die lineare Beschleunigung im Weltsystem.

use std::time::Instant;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::report::{sanitize_vec3, NormalizedInputReport};

/// Parameter der Fusion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    /// Effektives Fenster des Bias-Mittelwerts in Samples
    pub bias_window: u32,
    /// Maximale Änderung des Roh-Gyros zwischen zwei Samples, bei der der Bias
    /// noch nachgeführt wird. Empirischer Wert, nicht hergeleitet.
    pub bias_gate: f32,
    /// Gewicht des Beschleunigungssensors im Komplementärfilter
    pub accel_correction: f32,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            bias_window: 200,
            bias_gate: 1.0,
            accel_correction: 0.05,
        }
    }
}

/// Inkrementeller Mittelwert mit gedeckelter Sample-Anzahl
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpMovingAverage {
    n: u32,
    average: Vec3,
}

impl ExpMovingAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nimmt ein Sample auf. Ab `max_n` Samples wirkt der Mittelwert wie ein
    /// exponentieller Filter mit Gewicht `1/max_n`.
    pub fn update(&mut self, sample: Vec3, max_n: u32) -> Vec3 {
        if self.n == 0 || self.n < max_n {
            self.n += 1;
        }
        self.average += (sample - self.average) / self.n as f32;
        self.average
    }

    pub fn average(&self) -> Vec3 {
        self.average
    }

    pub fn count(&self) -> u32 {
        self.n
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Einfacher Tiefpass `y = (1-k)*y + k*x`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LowPassFilter {
    y: f32,
}

impl LowPassFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: f32, strength: f32) -> f32 {
        let k = strength.clamp(0.0, 1.0);
        self.y = (1.0 - k) * self.y + k * sample;
        self.y
    }

    pub fn value(&self) -> f32 {
        self.y
    }
}

/// Ergebnis eines Fusionsschritts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub gyro: Vec3,
    pub gravity: Vec3,
    pub accel: Vec3,
    pub orientation: Quat,
    pub delta_rotation: Quat,
    pub delta_time: f32,
}

const INITIAL_GRAVITY: Vec3 = Vec3::new(0.0, -1.0, 0.0);

#[derive(Debug, Clone)]
pub struct MotionProcessor {
    settings: MotionSettings,
    bias: ExpMovingAverage,
    last_raw_gyro: Vec3,
    orientation: Quat,
    delta_rotation: Quat,
    /// Zeigt zum Erdmittelpunkt, nach außen wird das Negative gemeldet
    gravity: Vec3,
    last_update: Option<Instant>,
}

impl Default for MotionProcessor {
    fn default() -> Self {
        Self::new(MotionSettings::default())
    }
}

impl MotionProcessor {
    pub fn new(settings: MotionSettings) -> Self {
        Self {
            settings,
            bias: ExpMovingAverage::new(),
            last_raw_gyro: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            delta_rotation: Quat::IDENTITY,
            gravity: INITIAL_GRAVITY,
            last_update: None,
        }
    }

    pub fn bias(&self) -> Vec3 {
        self.bias.average()
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    /// Fusioniert `raw_accel` und `gyro` des Reports und schreibt die Ergebnisse zurück.
    ///
    /// `dt` stammt aus der Wanduhr, der erste Aufruf hat `dt = 0`.
    pub fn update(&mut self, report: &mut NormalizedInputReport) {
        let now = Instant::now();
        let dt = self
            .last_update
            .map(|last| now.duration_since(last).as_secs_f32())
            .unwrap_or(0.0);
        self.last_update = Some(now);

        let sample = self.step(report.raw_accel, report.gyro, dt);

        report.gyro = sample.gyro;
        report.gravity = sample.gravity;
        report.accel = sample.accel;
        report.orientation = sample.orientation;
        report.delta_rotation = sample.delta_rotation;
        report.delta_time = sample.delta_time;
        report.sanitize();
    }

    /// Ein Fusionsschritt mit vorgegebenem `dt` in Sekunden
    pub fn step(&mut self, raw_accel: Vec3, raw_gyro: Vec3, dt: f32) -> MotionSample {
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        let raw_accel = sanitize_vec3(raw_accel);
        let raw_gyro = sanitize_vec3(raw_gyro);

        if (raw_gyro - self.last_raw_gyro).length() < self.settings.bias_gate {
            self.bias.update(raw_gyro, self.settings.bias_window);
        }
        self.last_raw_gyro = raw_gyro;
        let gyro = raw_gyro - self.bias.average();

        let angle = gyro.length().to_radians() * dt;
        self.delta_rotation = if angle != 0.0 && angle.is_finite() {
            Quat::from_axis_angle(gyro.normalize(), angle).normalize()
        } else {
            Quat::IDENTITY
        };

        let rotated = self.delta_rotation.inverse() * self.gravity;
        self.gravity = match raw_accel.try_normalize() {
            Some(unit_accel) => {
                let k = self.settings.accel_correction;
                ((1.0 - k) * rotated + k * -unit_accel)
                    .try_normalize()
                    .unwrap_or(rotated)
            }
            None => rotated,
        };
        if !self.gravity.is_finite() {
            self.gravity = INITIAL_GRAVITY;
        }

        self.orientation = (self.orientation * self.delta_rotation).normalize();
        if !self.orientation.is_finite() {
            self.orientation = Quat::IDENTITY;
        }

        MotionSample {
            gyro,
            gravity: -self.gravity,
            accel: sanitize_vec3(self.orientation * (raw_accel + self.gravity)),
            orientation: self.orientation,
            delta_rotation: self.delta_rotation,
            delta_time: dt,
        }
    }
}
