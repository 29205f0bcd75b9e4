//! Geräteunabhängige Input- und Output-Reports
//!
//! Jeder Transport dekodiert in einen [`NormalizedInputReport`] und kodiert aus
//! einem [`NormalizedOutputReport`]. Die Array-Längen stammen aus dem
//! [`ReportLayout`] und ändern sich danach nicht mehr. Analoge Werte werden von
//! jedem Setter und von [`NormalizedInputReport::sanitize`] in ihren Bereich geklemmt.

pub mod pov;

use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};

pub use pov::{angle_to_buttons, buttons_to_angle, Pov, PovDirections};

/// Maximale Anzahl Touch-Punkte pro Report
pub const MAX_TOUCHES: usize = 2;

/// Maximale Anzahl Hats pro Report
pub const MAX_POVS: usize = 4;

/// Anzahl Rumble-Motoren und Zusatz-LEDs im Output-Report
pub const OUTPUT_CHANNELS: usize = 6;

/// Form des Input-Reports, einmal pro Geräteinstanz festgelegt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLayout {
    pub axes: u8,
    pub sliders: u8,
    pub buttons: u8,
    pub povs: u8,
    pub touches: u8,
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self {
            axes: 6,
            sliders: 0,
            buttons: 14,
            povs: 1,
            touches: 2,
        }
    }
}

/// Ein Finger auf dem Touchpad, Position auf beiden Achsen in [0,1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Touch {
    pub id: u8,
    pub pressed: bool,
    pub position: Vec2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedInputReport {
    battery: f32,
    usb: bool,
    axes: Box<[f32]>,
    sliders: Box<[f32]>,
    buttons: Box<[bool]>,
    povs: Box<[Pov]>,
    touches: Box<[Touch]>,
    touchpad_size: Vec2,

    /// Beschleunigung in g, wie dekodiert
    pub raw_accel: Vec3,
    /// Drehrate in Grad/s, nach dem Dekodieren roh, nach der Fusion bias-korrigiert
    pub gyro: Vec3,
    /// Geschätzter "oben"-Vektor
    pub gravity: Vec3,
    /// Lineare Beschleunigung im Weltsystem ohne Schwerkraft
    pub accel: Vec3,
    pub orientation: Quat,
    pub delta_rotation: Quat,
    /// Sekunden seit dem letzten fusionierten Sample
    pub delta_time: f32,
}

impl Default for NormalizedInputReport {
    fn default() -> Self {
        Self::new(ReportLayout::default())
    }
}

impl NormalizedInputReport {
    pub fn new(layout: ReportLayout) -> Self {
        let povs = usize::from(layout.povs).clamp(1, MAX_POVS);
        let touches = usize::from(layout.touches).min(MAX_TOUCHES);

        Self {
            battery: 0.0,
            usb: false,
            axes: vec![0.0; usize::from(layout.axes)].into_boxed_slice(),
            sliders: vec![0.0; usize::from(layout.sliders)].into_boxed_slice(),
            buttons: vec![false; usize::from(layout.buttons)].into_boxed_slice(),
            povs: vec![Pov::default(); povs].into_boxed_slice(),
            touches: vec![Touch::default(); touches].into_boxed_slice(),
            touchpad_size: Vec2::ZERO,
            raw_accel: Vec3::ZERO,
            gyro: Vec3::ZERO,
            gravity: Vec3::ZERO,
            accel: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            delta_rotation: Quat::IDENTITY,
            delta_time: 0.0,
        }
    }

    pub fn layout(&self) -> ReportLayout {
        ReportLayout {
            axes: self.axes.len() as u8,
            sliders: self.sliders.len() as u8,
            buttons: self.buttons.len() as u8,
            povs: self.povs.len() as u8,
            touches: self.touches.len() as u8,
        }
    }

    pub fn battery(&self) -> f32 {
        self.battery
    }

    pub fn set_battery(&mut self, level: f32) {
        self.battery = clamp_unit(level);
    }

    pub fn usb(&self) -> bool {
        self.usb
    }

    pub fn set_usb(&mut self, usb: bool) {
        self.usb = usb;
    }

    pub fn axes(&self) -> &[f32] {
        &self.axes
    }

    pub fn axis(&self, index: usize) -> Option<f32> {
        self.axes.get(index).copied()
    }

    /// Schreibt eine Achse geklemmt auf [-1,1]. Indizes außerhalb des Layouts werden ignoriert.
    pub fn set_axis(&mut self, index: usize, value: f32) {
        if let Some(slot) = self.axes.get_mut(index) {
            *slot = clamp_signed(value);
        }
    }

    pub fn sliders(&self) -> &[f32] {
        &self.sliders
    }

    pub fn slider(&self, index: usize) -> Option<f32> {
        self.sliders.get(index).copied()
    }

    pub fn set_slider(&mut self, index: usize, value: f32) {
        if let Some(slot) = self.sliders.get_mut(index) {
            *slot = clamp_signed(value);
        }
    }

    pub fn buttons(&self) -> &[bool] {
        &self.buttons
    }

    pub fn button(&self, index: usize) -> Option<bool> {
        self.buttons.get(index).copied()
    }

    pub fn set_button(&mut self, index: usize, pressed: bool) {
        if let Some(slot) = self.buttons.get_mut(index) {
            *slot = pressed;
        }
    }

    pub fn povs(&self) -> &[Pov] {
        &self.povs
    }

    pub fn pov(&self, index: usize) -> Option<&Pov> {
        self.povs.get(index)
    }

    pub fn pov_mut(&mut self, index: usize) -> Option<&mut Pov> {
        self.povs.get_mut(index)
    }

    pub fn touches(&self) -> &[Touch] {
        &self.touches
    }

    /// Speichert einen Touch, Position auf das Einheitsquadrat geklemmt
    pub fn set_touch(&mut self, index: usize, touch: Touch) {
        if let Some(slot) = self.touches.get_mut(index) {
            *slot = Touch {
                position: sanitize_vec2(touch.position).clamp(Vec2::ZERO, Vec2::ONE),
                ..touch
            };
        }
    }

    pub fn touchpad_size(&self) -> Vec2 {
        self.touchpad_size
    }

    pub fn set_touchpad_size(&mut self, size: Vec2) {
        self.touchpad_size = size;
    }

    /// Klemmt alle analogen Felder und nullt jeden Vektor, dessen Länge kein
    /// normaler endlicher Float ist.
    pub fn sanitize(&mut self) {
        self.battery = clamp_unit(self.battery);
        for axis in self.axes.iter_mut() {
            *axis = clamp_signed(*axis);
        }
        for slider in self.sliders.iter_mut() {
            *slider = clamp_signed(*slider);
        }
        for touch in self.touches.iter_mut() {
            touch.position = sanitize_vec2(touch.position).clamp(Vec2::ZERO, Vec2::ONE);
        }

        self.raw_accel = sanitize_vec3(self.raw_accel);
        self.gyro = sanitize_vec3(self.gyro);
        self.gravity = sanitize_vec3(self.gravity);
        self.accel = sanitize_vec3(self.accel);

        if !self.orientation.is_finite() {
            self.orientation = Quat::IDENTITY;
        }
        if !self.delta_rotation.is_finite() {
            self.delta_rotation = Quat::IDENTITY;
        }
        if !self.delta_time.is_finite() || self.delta_time < 0.0 {
            self.delta_time = 0.0;
        }
    }
}

/// RGB-Lightbar mit Blinktiming, jeder Kanal in [0,1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Light {
    red: f32,
    green: f32,
    blue: f32,
    on_time: f32,
    off_time: f32,
}

impl Light {
    pub fn rgb(red: f32, green: f32, blue: f32) -> Self {
        let mut light = Self::default();
        light.set_rgb(red, green, blue, 1.0);
        light
    }

    /// Setzt alle Farbkanäle, skaliert mit `intensity`
    pub fn set_rgb(&mut self, red: f32, green: f32, blue: f32, intensity: f32) {
        self.red = clamp_unit(red * intensity);
        self.green = clamp_unit(green * intensity);
        self.blue = clamp_unit(blue * intensity);
    }

    pub fn red(&self) -> f32 {
        self.red
    }

    pub fn green(&self) -> f32 {
        self.green
    }

    pub fn blue(&self) -> f32 {
        self.blue
    }

    /// Anteil der Einschaltzeit beim Blinken, on und off beide null = dauerhaft an
    pub fn on_time(&self) -> f32 {
        self.on_time
    }

    pub fn off_time(&self) -> f32 {
        self.off_time
    }

    pub fn set_red(&mut self, value: f32) {
        self.red = clamp_unit(value);
    }

    pub fn set_green(&mut self, value: f32) {
        self.green = clamp_unit(value);
    }

    pub fn set_blue(&mut self, value: f32) {
        self.blue = clamp_unit(value);
    }

    pub fn set_on_time(&mut self, value: f32) {
        self.on_time = clamp_unit(value);
    }

    pub fn set_off_time(&mut self, value: f32) {
        self.off_time = clamp_unit(value);
    }
}

/// Feedback, das an das physische Gerät zurückgeht
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOutputReport {
    rumble: [f32; OUTPUT_CHANNELS],
    pub light: Light,
    ext_leds: [f32; OUTPUT_CHANNELS],
}

impl NormalizedOutputReport {
    pub fn rumble(&self) -> &[f32; OUTPUT_CHANNELS] {
        &self.rumble
    }

    pub fn set_rumble(&mut self, index: usize, value: f32) {
        if let Some(slot) = self.rumble.get_mut(index) {
            *slot = clamp_unit(value);
        }
    }

    /// Schwacher (rechter) Motor, Kanal 0
    pub fn weak(&self) -> f32 {
        self.rumble[0]
    }

    /// Starker (linker) Motor, Kanal 1
    pub fn strong(&self) -> f32 {
        self.rumble[1]
    }

    pub fn ext_leds(&self) -> &[f32; OUTPUT_CHANNELS] {
        &self.ext_leds
    }

    pub fn set_ext_led(&mut self, index: usize, value: f32) {
        if let Some(slot) = self.ext_leds.get_mut(index) {
            *slot = clamp_unit(value);
        }
    }
}

fn clamp_signed(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Nullvektor, sofern die Länge kein normaler Float ist
pub fn sanitize_vec3(v: Vec3) -> Vec3 {
    if v.length().is_normal() {
        v
    } else {
        Vec3::ZERO
    }
}

fn sanitize_vec2(v: Vec2) -> Vec2 {
    if v.length().is_normal() {
        v
    } else {
        Vec2::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes_arrays_and_clamps_povs() {
        let report = NormalizedInputReport::new(ReportLayout {
            axes: 6,
            sliders: 6,
            buttons: 32,
            povs: 9,
            touches: 5,
        });

        assert_eq!(report.axes().len(), 6);
        assert_eq!(report.sliders().len(), 6);
        assert_eq!(report.buttons().len(), 32);
        assert_eq!(report.povs().len(), MAX_POVS);
        assert_eq!(report.touches().len(), MAX_TOUCHES);

        let no_pov = NormalizedInputReport::new(ReportLayout {
            povs: 0,
            ..ReportLayout::default()
        });
        assert_eq!(no_pov.povs().len(), 1);
    }

    #[test]
    fn setters_clamp_and_ignore_out_of_range_indices() {
        let mut report = NormalizedInputReport::default();
        report.set_axis(0, 3.0);
        report.set_axis(1, f32::NAN);
        report.set_axis(99, 0.5);
        report.set_battery(1.7);

        assert_eq!(report.axis(0), Some(1.0));
        assert_eq!(report.axis(1), Some(0.0));
        assert_eq!(report.axis(99), None);
        assert_eq!(report.battery(), 1.0);
    }

    #[test]
    fn sanitize_zeroes_non_finite_vectors() {
        let mut report = NormalizedInputReport::default();
        report.raw_accel = Vec3::new(f32::NAN, 0.0, 1.0);
        report.gyro = Vec3::new(f32::INFINITY, 0.0, 0.0);
        report.gravity = Vec3::new(0.0, 1.0, 0.0);
        report.orientation = Quat::from_xyzw(f32::NAN, 0.0, 0.0, 1.0);

        report.sanitize();

        assert_eq!(report.raw_accel, Vec3::ZERO);
        assert_eq!(report.gyro, Vec3::ZERO);
        assert_eq!(report.gravity, Vec3::new(0.0, 1.0, 0.0));
        assert_eq!(report.orientation, Quat::IDENTITY);
    }

    #[test]
    fn output_channels_are_clamped() {
        let mut out = NormalizedOutputReport::default();
        out.set_rumble(0, 2.0);
        out.set_rumble(1, -1.0);
        out.set_ext_led(5, 0.25);
        out.light.set_rgb(1.0, 0.5, 4.0, 0.5);

        assert_eq!(out.weak(), 1.0);
        assert_eq!(out.strong(), 0.0);
        assert_eq!(out.ext_leds()[5], 0.25);
        assert_eq!(out.light.red(), 0.5);
        assert_eq!(out.light.green(), 0.25);
        assert_eq!(out.light.blue(), 1.0);
    }
}
