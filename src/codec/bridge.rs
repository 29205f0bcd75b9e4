//! Protokoll der Mikrocontroller-Bridges (seriell und TCP)
//!
//! Der Host schreibt ein einzelnes Opcode-Byte ([`INFO_REQUEST`] oder
//! [`STATE_REQUEST`]) und liest den passenden Report zurück. Alle Felder sind
//! little-endian und gepackt; der serielle Transport füllt die Frames auf feste
//! Größen auf.
//!
//! State-Report: `id:u8, axis[12]:i16, buttons[4]:u8, pov[2]:u16, accel[3]:i16, gyro[3]:i16`

use crate::codec::{decode_axis, encode_axis, encode_unit, ensure_len, read_i16, read_i16x3, read_u16, CodecError, SensorScale};
use crate::report::{NormalizedInputReport, NormalizedOutputReport, Pov, ReportLayout, OUTPUT_CHANNELS};

pub const INFO_REQUEST: u8 = 0x00;
pub const STATE_REQUEST: u8 = 0x01;

/// Protokollcode am Anfang jedes Output-Reports
pub const OUTPUT_CODE: u8 = 2;

const AXIS_FIELDS: usize = 12;
const PRIMARY_AXES: usize = 6;
const BUTTON_BYTES: usize = 4;
const POV_FIELDS: usize = 2;

const INFO_PACKED_LEN: usize = 7;
const STATE_PACKED_LEN: usize = 1 + AXIS_FIELDS * 2 + BUTTON_BYTES + POV_FIELDS * 2 + 6 + 6;
const OUTPUT_PACKED_LEN: usize = 2 + OUTPUT_CHANNELS * 2 + OUTPUT_CHANNELS;

const OFF_AXES: usize = 1;
const OFF_BUTTONS: usize = OFF_AXES + AXIS_FIELDS * 2;
const OFF_POVS: usize = OFF_BUTTONS + BUTTON_BYTES;
const OFF_ACCEL: usize = OFF_POVS + POV_FIELDS * 2;
const OFF_GYRO: usize = OFF_ACCEL + 6;

/// Layout, das jede Bridge unabhängig vom Info-Report meldet
pub const BRIDGE_LAYOUT: ReportLayout = ReportLayout {
    axes: 6,
    sliders: 6,
    buttons: 32,
    povs: 2,
    touches: 0,
};

/// Frame-Größen eines Bridge-Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub info_len: usize,
    pub state_len: usize,
    pub output_len: usize,
    /// Nach jedem Output ein Bestätigungsbyte lesen
    pub ack: bool,
}

impl Framing {
    /// Serielle Bridge: aufgefüllte Frames mit Ack-Byte
    pub const SERIAL: Framing = Framing {
        info_len: 32,
        state_len: 64,
        output_len: 33,
        ack: true,
    };

    /// TCP-Bridge: gepackte Frames, Info mit einem reservierten Byte
    pub const TCP: Framing = Framing {
        info_len: INFO_PACKED_LEN + 1,
        state_len: STATE_PACKED_LEN,
        output_len: OUTPUT_PACKED_LEN,
        ack: false,
    };
}

/// Einmaliger Info-Report einer Bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeInfo {
    pub axes: u8,
    pub buttons: u8,
    pub povs: u8,
    pub scale: SensorScale,
}

impl BridgeInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, INFO_PACKED_LEN)?;
        Ok(Self {
            axes: buf[0],
            buttons: buf[1],
            povs: buf[2],
            scale: SensorScale::new(read_u16(buf, 3), read_u16(buf, 5)),
        })
    }

    /// Kodiert den Info-Report auf `len` Bytes (Gegenstelle für Tests und Emulatoren)
    pub fn encode(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len.max(INFO_PACKED_LEN)];
        buf[0] = self.axes;
        buf[1] = self.buttons;
        buf[2] = self.povs;
        buf[3..5].copy_from_slice(&self.scale.accel.to_le_bytes());
        buf[5..7].copy_from_slice(&self.scale.gyro.to_le_bytes());
        buf
    }
}

/// Roher State-Report, wie er über die Leitung kommt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawState {
    pub id: u8,
    pub axes: [i16; AXIS_FIELDS],
    pub buttons: u32,
    pub povs: [u16; POV_FIELDS],
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
}

impl Default for RawState {
    fn default() -> Self {
        Self {
            id: 0,
            axes: [0; AXIS_FIELDS],
            buttons: 0,
            povs: [crate::report::pov::RAW_CENTERED; POV_FIELDS],
            accel: [0; 3],
            gyro: [0; 3],
        }
    }
}

impl RawState {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, STATE_PACKED_LEN)?;

        let mut axes = [0i16; AXIS_FIELDS];
        for (i, axis) in axes.iter_mut().enumerate() {
            *axis = read_i16(buf, OFF_AXES + i * 2);
        }

        Ok(Self {
            id: buf[0],
            axes,
            buttons: u32::from_le_bytes([
                buf[OFF_BUTTONS],
                buf[OFF_BUTTONS + 1],
                buf[OFF_BUTTONS + 2],
                buf[OFF_BUTTONS + 3],
            ]),
            povs: [read_u16(buf, OFF_POVS), read_u16(buf, OFF_POVS + 2)],
            accel: read_i16x3(buf, OFF_ACCEL),
            gyro: read_i16x3(buf, OFF_GYRO),
        })
    }

    pub fn encode(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len.max(STATE_PACKED_LEN)];
        buf[0] = self.id;
        for (i, axis) in self.axes.iter().enumerate() {
            let at = OFF_AXES + i * 2;
            buf[at..at + 2].copy_from_slice(&axis.to_le_bytes());
        }
        buf[OFF_BUTTONS..OFF_BUTTONS + 4].copy_from_slice(&self.buttons.to_le_bytes());
        for (i, pov) in self.povs.iter().enumerate() {
            let at = OFF_POVS + i * 2;
            buf[at..at + 2].copy_from_slice(&pov.to_le_bytes());
        }
        for i in 0..3 {
            let at = OFF_ACCEL + i * 2;
            buf[at..at + 2].copy_from_slice(&self.accel[i].to_le_bytes());
            let at = OFF_GYRO + i * 2;
            buf[at..at + 2].copy_from_slice(&self.gyro[i].to_le_bytes());
        }
        buf
    }
}

/// Dekodiert einen State-Report in einen bestehenden Report.
///
/// Die ersten sechs Achsen landen in `axes`, die restlichen in `sliders`.
/// Sensorwerte werden mit `scale` skaliert und danach bereinigt.
pub fn decode_state_into(
    buf: &[u8],
    scale: &SensorScale,
    report: &mut NormalizedInputReport,
) -> Result<(), CodecError> {
    let raw = RawState::decode(buf)?;

    for (i, value) in raw.axes.iter().enumerate() {
        if i < PRIMARY_AXES {
            report.set_axis(i, decode_axis(*value));
        } else {
            report.set_slider(i - PRIMARY_AXES, decode_axis(*value));
        }
    }

    let buttons = report.buttons().len().min(BUTTON_BYTES * 8);
    for i in 0..buttons {
        report.set_button(i, raw.buttons & (1 << i) != 0);
    }

    for (i, raw_pov) in raw.povs.iter().enumerate() {
        if let Some(pov) = report.pov_mut(i) {
            *pov = Pov::from_centidegrees(*raw_pov);
        }
    }

    report.raw_accel = scale.accel(raw.accel);
    report.gyro = scale.gyro(raw.gyro);
    report.sanitize();

    Ok(())
}

/// Dekodiert einen State-Report in einen frischen Report mit [`BRIDGE_LAYOUT`]
pub fn decode_state(buf: &[u8], scale: &SensorScale) -> Result<NormalizedInputReport, CodecError> {
    let mut report = NormalizedInputReport::new(BRIDGE_LAYOUT);
    decode_state_into(buf, scale, &mut report)?;
    Ok(report)
}

/// Kodiert einen Output-Report, aufgefüllt auf `framing.output_len`
pub fn encode_output(report: &NormalizedOutputReport, framing: &Framing) -> Vec<u8> {
    let mut buf = vec![0u8; framing.output_len.max(OUTPUT_PACKED_LEN)];
    buf[0] = OUTPUT_CODE;
    buf[1] = 0;

    for (i, motor) in report.rumble().iter().enumerate() {
        let at = 2 + i * 2;
        buf[at..at + 2].copy_from_slice(&encode_axis(*motor).to_le_bytes());
    }

    let led_base = 2 + OUTPUT_CHANNELS * 2;
    for (i, led) in report.ext_leds().iter().enumerate() {
        buf[led_base + i] = encode_unit(*led);
    }

    buf
}
