//! Interpretiertes Regel-Backend (`.toml`-Profile)
//!
//! ```toml
//! [[rule]]
//! source = "axis.4"      # L2
//! target = "rumble.1"
//! scale = 0.8
//! smooth = 0.3
//!
//! [[rule]]
//! source = "battery"
//! target = "led.green"
//!
//! [[console]]
//! button = 12
//! message = "PS gedrückt"
//! ```
//!
//! Jede Regel liefert `quelle * scale + offset`. Regeln mit demselben Ziel
//! werden addiert, das Ergebnis anschließend auf [0,1] geklemmt.

use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::motion::LowPassFilter;
use crate::remap::{ConsoleSink, Profile, RemapBackend, RemapError};
use crate::report::{NormalizedInputReport, NormalizedOutputReport, OUTPUT_CHANNELS};

pub const PROFILE_KEY: &str = "toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Right,
    Down,
    Left,
}

/// Eingangswert einer Regel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Axis(usize),
    Slider(usize),
    Button(usize),
    Pov(usize, Direction),
    Battery,
    Accel(Component),
    Gyro(Component),
    /// Immer 1.0
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedChannel {
    Red,
    Green,
    Blue,
    On,
    Off,
}

/// Ausgangskanal einer Regel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Rumble(usize),
    Led(LedChannel),
    ExtLed(usize),
}

fn parse_index(part: Option<&str>, what: &str) -> Result<usize, RemapError> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| RemapError::Compile(format!("'{what}' braucht einen numerischen Index")))
}

fn parse_component(part: Option<&str>, what: &str) -> Result<Component, RemapError> {
    match part {
        Some("x") => Ok(Component::X),
        Some("y") => Ok(Component::Y),
        Some("z") => Ok(Component::Z),
        _ => Err(RemapError::Compile(format!("'{what}' braucht x, y oder z"))),
    }
}

impl FromStr for Source {
    type Err = RemapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let head = parts.next().unwrap_or_default();
        let source = match head {
            "axis" => Source::Axis(parse_index(parts.next(), s)?),
            "slider" => Source::Slider(parse_index(parts.next(), s)?),
            "button" => Source::Button(parse_index(parts.next(), s)?),
            "pov" => {
                let index = parse_index(parts.next(), s)?;
                let dir = match parts.next() {
                    Some("up") => Direction::Up,
                    Some("right") => Direction::Right,
                    Some("down") => Direction::Down,
                    Some("left") => Direction::Left,
                    _ => {
                        return Err(RemapError::Compile(format!(
                            "'{s}' braucht up, right, down oder left"
                        )))
                    }
                };
                Source::Pov(index, dir)
            }
            "battery" => Source::Battery,
            "accel" => Source::Accel(parse_component(parts.next(), s)?),
            "gyro" => Source::Gyro(parse_component(parts.next(), s)?),
            "constant" => Source::Constant,
            _ => return Err(RemapError::Compile(format!("Unbekannte Quelle '{s}'"))),
        };
        if parts.next().is_some() {
            return Err(RemapError::Compile(format!("Unbekannte Quelle '{s}'")));
        }
        Ok(source)
    }
}

impl FromStr for Target {
    type Err = RemapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let target = match parts.next().unwrap_or_default() {
            "rumble" => Target::Rumble(parse_index(parts.next(), s)?),
            "ext_led" => Target::ExtLed(parse_index(parts.next(), s)?),
            "led" => Target::Led(match parts.next() {
                Some("red") => LedChannel::Red,
                Some("green") => LedChannel::Green,
                Some("blue") => LedChannel::Blue,
                Some("on") => LedChannel::On,
                Some("off") => LedChannel::Off,
                _ => {
                    return Err(RemapError::Compile(format!(
                        "'{s}' braucht red, green, blue, on oder off"
                    )))
                }
            }),
            _ => return Err(RemapError::Compile(format!("Unbekanntes Ziel '{s}'"))),
        };
        if parts.next().is_some() {
            return Err(RemapError::Compile(format!("Unbekanntes Ziel '{s}'")));
        }
        match target {
            Target::Rumble(i) | Target::ExtLed(i) if i >= OUTPUT_CHANNELS => Err(
                RemapError::Compile(format!("'{s}': Index außerhalb von 0..{OUTPUT_CHANNELS}")),
            ),
            _ => Ok(target),
        }
    }
}

fn one() -> f32 {
    1.0
}

fn finite(value: f32, field: &str, source: &str) -> Result<f32, RemapError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RemapError::Compile(format!(
            "'{field}' der Regel für '{source}' muss endlich sein, ist {value}"
        )))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    source: String,
    target: String,
    #[serde(default = "one")]
    scale: f32,
    #[serde(default)]
    offset: f32,
    smooth: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsoleEntry {
    button: usize,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleEntry>,
    #[serde(default, rename = "console")]
    consoles: Vec<ConsoleEntry>,
}

#[derive(Debug)]
struct Rule {
    source: Source,
    target: Target,
    scale: f32,
    offset: f32,
    smooth: Option<(f32, LowPassFilter)>,
}

#[derive(Debug)]
struct ConsoleRule {
    button: usize,
    message: String,
    was_pressed: bool,
}

pub struct RuleBackend {
    name: String,
    rules: Vec<Rule>,
    consoles: Vec<ConsoleRule>,
    console: ConsoleSink,
}

impl RuleBackend {
    pub fn parse(name: &str, content: &str, console: ConsoleSink) -> Result<Self, RemapError> {
        let file: RuleFile =
            toml::from_str(content).map_err(|e| RemapError::Compile(e.to_string()))?;

        let rules = file
            .rules
            .into_iter()
            .map(|entry| {
                let smooth = entry
                    .smooth
                    .map(|k| finite(k, "smooth", &entry.source))
                    .transpose()?;
                Ok(Rule {
                    scale: finite(entry.scale, "scale", &entry.source)?,
                    offset: finite(entry.offset, "offset", &entry.source)?,
                    smooth: smooth.map(|k| (k.clamp(0.0, 1.0), LowPassFilter::new())),
                    source: entry.source.parse()?,
                    target: entry.target.parse()?,
                })
            })
            .collect::<Result<Vec<_>, RemapError>>()?;

        let consoles = file
            .consoles
            .into_iter()
            .map(|entry| ConsoleRule {
                button: entry.button,
                message: entry.message,
                was_pressed: false,
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            rules,
            consoles,
            console,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn out_of_range(what: &str, index: usize, len: usize) -> RemapError {
    RemapError::Runtime(format!("{what}.{index} existiert nicht, Gerät hat {len}"))
}

fn read_source(source: Source, input: &NormalizedInputReport) -> Result<f32, RemapError> {
    let flag = |b: bool| if b { 1.0 } else { 0.0 };
    let component = |v: glam::Vec3, c: Component| match c {
        Component::X => v.x,
        Component::Y => v.y,
        Component::Z => v.z,
    };

    Ok(match source {
        Source::Axis(i) => input
            .axis(i)
            .ok_or_else(|| out_of_range("axis", i, input.axes().len()))?,
        Source::Slider(i) => input
            .slider(i)
            .ok_or_else(|| out_of_range("slider", i, input.sliders().len()))?,
        Source::Button(i) => flag(
            input
                .button(i)
                .ok_or_else(|| out_of_range("button", i, input.buttons().len()))?,
        ),
        Source::Pov(i, dir) => {
            let pov = input
                .pov(i)
                .ok_or_else(|| out_of_range("pov", i, input.povs().len()))?;
            flag(match dir {
                Direction::Up => pov.up(),
                Direction::Right => pov.right(),
                Direction::Down => pov.down(),
                Direction::Left => pov.left(),
            })
        }
        Source::Battery => input.battery(),
        Source::Accel(c) => component(input.accel, c),
        Source::Gyro(c) => component(input.gyro, c),
        Source::Constant => 1.0,
    })
}

fn write_target(target: Target, out: &mut NormalizedOutputReport, value: f32) {
    match target {
        Target::Rumble(i) => out.set_rumble(i, value),
        Target::ExtLed(i) => out.set_ext_led(i, value),
        Target::Led(LedChannel::Red) => out.light.set_red(value),
        Target::Led(LedChannel::Green) => out.light.set_green(value),
        Target::Led(LedChannel::Blue) => out.light.set_blue(value),
        Target::Led(LedChannel::On) => out.light.set_on_time(value),
        Target::Led(LedChannel::Off) => out.light.set_off_time(value),
    }
}

impl RemapBackend for RuleBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn remap(
        &mut self,
        input: &NormalizedInputReport,
        _dt: f32,
    ) -> Result<NormalizedOutputReport, RemapError> {
        // Summen ungeklemmt sammeln, die Setter klemmen
        let mut sums: Vec<(Target, f32)> = Vec::with_capacity(self.rules.len());
        for rule in self.rules.iter_mut() {
            let mut value = read_source(rule.source, input)? * rule.scale + rule.offset;
            if let Some((strength, filter)) = rule.smooth.as_mut() {
                value = filter.update(value, *strength);
            }
            match sums.iter_mut().find(|(t, _)| *t == rule.target) {
                Some((_, sum)) => *sum += value,
                None => sums.push((rule.target, value)),
            }
        }

        let mut out = NormalizedOutputReport::default();
        for (target, value) in sums {
            write_target(target, &mut out, value);
        }

        for entry in self.consoles.iter_mut() {
            let pressed = input
                .button(entry.button)
                .ok_or_else(|| out_of_range("button", entry.button, input.buttons().len()))?;
            if pressed && !entry.was_pressed {
                self.console.print(entry.message.clone());
            }
            entry.was_pressed = pressed;
        }

        Ok(out)
    }

    fn shutdown(&mut self) {
        debug!("Rule backend {} shut down", self.name);
    }
}

/// Lader für die [`crate::remap::BackendRegistry`]
pub fn load(profile: &Profile, console: ConsoleSink) -> Result<Box<dyn RemapBackend>, RemapError> {
    let content = profile.read_to_string()?;
    let backend = RuleBackend::parse(&profile.to_string(), &content, console.clone())?;
    if backend.rule_count() == 0 && backend.consoles.is_empty() {
        console.warn(format!("{profile} enthält keine Regeln"));
    }
    Ok(Box::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remap::events::{EventEmitter, RemapEventKind};
    use approx::assert_relative_eq;
    use tokio::sync::mpsc;

    fn parse(content: &str) -> RuleBackend {
        RuleBackend::parse("test", content, ConsoleSink::disabled("pad")).unwrap()
    }

    #[test]
    fn source_and_target_syntax() {
        assert_eq!("axis.3".parse::<Source>().unwrap(), Source::Axis(3));
        assert_eq!(
            "pov.0.left".parse::<Source>().unwrap(),
            Source::Pov(0, Direction::Left)
        );
        assert_eq!("gyro.z".parse::<Source>().unwrap(), Source::Gyro(Component::Z));
        assert_eq!("led.off".parse::<Target>().unwrap(), Target::Led(LedChannel::Off));
        assert!("axis".parse::<Source>().is_err());
        assert!("axis.1.2".parse::<Source>().is_err());
        assert!("wheel.0".parse::<Source>().is_err());
        assert!("rumble.6".parse::<Target>().is_err());
    }

    #[test]
    fn scale_offset_and_summing() {
        let mut backend = parse(
            r#"
            [[rule]]
            source = "axis.0"
            target = "rumble.0"
            scale = 0.5
            offset = 0.1

            [[rule]]
            source = "button.1"
            target = "led.red"

            [[rule]]
            source = "button.2"
            target = "led.red"
            scale = 0.25

            [[rule]]
            source = "constant"
            target = "ext_led.5"
            scale = 0.75
            "#,
        );

        let mut input = NormalizedInputReport::default();
        input.set_axis(0, 1.0);
        input.set_button(2, true);
        let out = backend.remap(&input, 0.02).unwrap();

        assert_relative_eq!(out.rumble()[0], 0.6);
        assert_relative_eq!(out.light.red(), 0.25);
        assert_relative_eq!(out.ext_leds()[5], 0.75);

        input.set_button(1, true);
        let out = backend.remap(&input, 0.02).unwrap();
        assert_eq!(out.light.red(), 1.0);
    }

    #[test]
    fn smoothing_lags_behind_input() {
        let mut backend = parse(
            r#"
            [[rule]]
            source = "axis.0"
            target = "rumble.1"
            smooth = 0.5
            "#,
        );
        let mut input = NormalizedInputReport::default();
        input.set_axis(0, 1.0);

        assert_relative_eq!(backend.remap(&input, 0.02).unwrap().strong(), 0.5);
        assert_relative_eq!(backend.remap(&input, 0.02).unwrap().strong(), 0.75);
    }

    #[test]
    fn index_beyond_layout_is_runtime_error() {
        let mut backend = parse(
            r#"
            [[rule]]
            source = "slider.2"
            target = "rumble.0"
            "#,
        );
        let err = backend
            .remap(&NormalizedInputReport::default(), 0.0)
            .unwrap_err();
        assert!(matches!(err, RemapError::Runtime(_)));
    }

    #[test]
    fn unknown_field_or_source_fails_to_compile() {
        let err = RuleBackend::parse(
            "bad",
            "[[rule]]\nsource = \"axis.0\"\ntarget = \"rumble.0\"\ngain = 2.0",
            ConsoleSink::disabled("pad"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RemapError::Compile(_)));

        let err = RuleBackend::parse(
            "bad",
            "[[rule]]\nsource = \"trigger.0\"\ntarget = \"rumble.0\"",
            ConsoleSink::disabled("pad"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RemapError::Compile(_)));
    }

    #[test]
    fn non_finite_numbers_fail_to_compile() {
        for field in ["scale = nan", "offset = inf", "smooth = -inf", "smooth = nan"] {
            let content = format!("[[rule]]\nsource = \"axis.0\"\ntarget = \"rumble.0\"\n{field}");
            let err = RuleBackend::parse("bad", &content, ConsoleSink::disabled("pad"))
                .err()
                .unwrap();
            assert!(matches!(err, RemapError::Compile(_)), "{field}");
        }
    }

    #[test]
    fn console_fires_on_rising_edge_only() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut backend = RuleBackend::parse(
            "console",
            "[[console]]\nbutton = 0\nmessage = \"hi\"",
            ConsoleSink::new(EventEmitter::new("pad", tx)),
        )
        .unwrap();

        let mut input = NormalizedInputReport::default();
        input.set_button(0, true);
        backend.remap(&input, 0.0).unwrap();
        backend.remap(&input, 0.0).unwrap();
        input.set_button(0, false);
        backend.remap(&input, 0.0).unwrap();
        input.set_button(0, true);
        backend.remap(&input, 0.0).unwrap();

        let mut messages = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.kind, RemapEventKind::Console("hi".to_string()));
            messages += 1;
        }
        assert_eq!(messages, 2);
    }

    #[test]
    fn empty_profile_loads_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "").unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let backend = load(&Profile::new(&path), ConsoleSink::new(EventEmitter::new("pad", tx)));
        assert!(backend.is_ok());
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            RemapEventKind::Warning(_)
        ));
    }

    #[test]
    fn missing_file_is_load_error() {
        let err = load(&Profile::new("/nonexistent/p.toml"), ConsoleSink::disabled("pad"))
            .err()
            .unwrap();
        assert!(matches!(err, RemapError::Load { .. }));
    }
}
