//! Kompiliertes Backend: registrierte Rust-Funktionen
//!
//! Eine `.native`-Profildatei enthält nur den Namen der Funktion, unter dem
//! sie in der [`NativeRegistry`] eingetragen wurde.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::remap::{ConsoleSink, Profile, RemapBackend, RemapError};
use crate::report::{NormalizedInputReport, NormalizedOutputReport};

pub const PROFILE_KEY: &str = "native";

pub type NativeFn = Box<
    dyn FnMut(&NormalizedInputReport, f32, &ConsoleSink) -> Result<NormalizedOutputReport, String>
        + Send,
>;

/// Erzeugt für jeden Ladevorgang eine frische Funktion mit eigenem Zustand
pub type NativeConstructor = Arc<dyn Fn() -> NativeFn + Send + Sync>;

#[derive(Clone, Default)]
pub struct NativeRegistry {
    constructors: HashMap<String, NativeConstructor>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry mit den mitgelieferten Funktionen `trigger_rumble` und `battery_light`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("trigger_rumble", || -> NativeFn { Box::new(trigger_rumble) });
        registry.register("battery_light", || -> NativeFn { Box::new(battery_light) });
        registry
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> NativeFn + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn build(&self, name: &str) -> Option<NativeFn> {
        self.constructors.get(name).map(|constructor| constructor())
    }
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Linker Trigger auf den schwachen, rechter auf den starken Motor
///
/// Nimmt die letzten beiden Achsen, beim DualShock sind das L2 und R2.
fn trigger_rumble(
    input: &NormalizedInputReport,
    _dt: f32,
    _console: &ConsoleSink,
) -> Result<NormalizedOutputReport, String> {
    let axes = input.axes();
    let mut out = NormalizedOutputReport::default();
    if let [.., left, right] = axes {
        out.set_rumble(0, *left);
        out.set_rumble(1, *right);
    }
    Ok(out)
}

/// Lichtleiste von rot (leer) nach grün (voll)
fn battery_light(
    input: &NormalizedInputReport,
    _dt: f32,
    _console: &ConsoleSink,
) -> Result<NormalizedOutputReport, String> {
    let level = input.battery();
    let mut out = NormalizedOutputReport::default();
    out.light.set_rgb(1.0 - level, level, 0.0, 1.0);
    Ok(out)
}

pub struct NativeBackend {
    name: String,
    function: NativeFn,
    console: ConsoleSink,
}

impl RemapBackend for NativeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn remap(
        &mut self,
        input: &NormalizedInputReport,
        dt: f32,
    ) -> Result<NormalizedOutputReport, RemapError> {
        (self.function)(input, dt, &self.console).map_err(RemapError::Runtime)
    }
}

pub fn load(
    registry: &NativeRegistry,
    profile: &Profile,
    console: ConsoleSink,
) -> Result<Box<dyn RemapBackend>, RemapError> {
    let content = profile.read_to_string()?;
    let name = content.trim();
    if name.is_empty() {
        return Err(RemapError::Compile(format!(
            "{profile} nennt keine Funktion"
        )));
    }
    let function = registry.build(name).ok_or_else(|| {
        RemapError::Compile(format!(
            "Funktion '{name}' ist nicht registriert (bekannt: {})",
            registry.names().join(", ")
        ))
    })?;
    Ok(Box::new(NativeBackend {
        name: name.to_string(),
        function,
        console,
    }))
}
