//! DualShock 4 HID-Reports (USB und Bluetooth)
//!
//! Über Bluetooth beginnt der Input-Report mit der ID 0x11 und die Daten sind
//! um zwei Bytes verschoben. Der Bluetooth-Output-Report trägt eine CRC-32 über
//! die ersten 75 Bytes inklusive des Headers 0xA2, der selbst nicht gesendet wird.

use crc::{Crc, CRC_32_ISO_HDLC};
use glam::{Vec2, Vec3};

use crate::codec::{decode_unit, encode_unit, ensure_len, read_i16x3, CodecError};
use crate::report::{NormalizedInputReport, NormalizedOutputReport, Pov, ReportLayout, Touch};

pub const VENDOR_ID: u16 = 0x054C;

pub const USB_REPORT_ID: u8 = 0x01;
pub const BT_REPORT_ID: u8 = 0x11;

/// Feature-Report, dessen Abfrage den erweiterten Report-Modus aktiviert
pub const CALIBRATION_FEATURE_ID: u8 = 0x05;

pub const TOUCHPAD_SIZE: Vec2 = Vec2::new(1920.0, 943.0);

const GYRO_SCALE: f32 = 2000.0 / 32767.0;
const ACCEL_SCALE: f32 = 1.0 / 8192.0;

const USB_OUTPUT_LEN: usize = 32;
const BT_OUTPUT_LEN: usize = 79;
const BT_CRC_RANGE: usize = 75;

/// Letztes Byte, das aus dem Datenblock gelesen wird
const STATE_LEN: usize = 43;

const BT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Layout: LX, LY, RX, RY, L2, R2; 14 Buttons; ein Hat; zwei Touch-Punkte
pub const DS4_LAYOUT: ReportLayout = ReportLayout {
    axes: 6,
    sliders: 0,
    buttons: 14,
    povs: 1,
    touches: 2,
};

/// Button-Indizes im normalisierten Report
pub mod button {
    pub const SQUARE: usize = 0;
    pub const CROSS: usize = 1;
    pub const CIRCLE: usize = 2;
    pub const TRIANGLE: usize = 3;
    pub const L1: usize = 4;
    pub const R1: usize = 5;
    pub const L2: usize = 6;
    pub const R2: usize = 7;
    pub const SHARE: usize = 8;
    pub const OPTIONS: usize = 9;
    pub const L3: usize = 10;
    pub const R3: usize = 11;
    pub const PS: usize = 12;
    pub const TOUCH_CLICK: usize = 13;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Bluetooth,
}

impl Connection {
    /// Bestimmt die Verbindung anhand der Report-ID im ersten Byte
    pub fn detect(buf: &[u8]) -> Result<Self, CodecError> {
        match buf.first() {
            Some(&USB_REPORT_ID) => Ok(Self::Usb),
            Some(&BT_REPORT_ID) => Ok(Self::Bluetooth),
            Some(other) => Err(CodecError::UnexpectedReportId(*other)),
            None => Err(CodecError::ShortFrame {
                expected: 1,
                actual: 0,
            }),
        }
    }

    fn offset(self) -> usize {
        match self {
            Self::Usb => 0,
            Self::Bluetooth => 2,
        }
    }
}

fn stick(raw: u8) -> f32 {
    let centered = i16::from(raw) - 128;
    if centered < 0 {
        f32::from(centered) / 128.0
    } else {
        f32::from(centered) / 127.0
    }
}

fn bit(byte: u8, n: u8) -> bool {
    byte & (1 << n) != 0
}

fn decode_touch(data: &[u8]) -> Touch {
    let x = u16::from(data[1]) | (u16::from(data[2] & 0x0F) << 8);
    let y = (u16::from(data[2] & 0xF0) >> 4) | (u16::from(data[3]) << 4);
    Touch {
        id: data[0] & 0x7F,
        pressed: data[0] & 0x80 == 0,
        position: Vec2::new(f32::from(x), f32::from(y)) / TOUCHPAD_SIZE,
    }
}

/// Dekodiert einen Input-Report in `report` und liefert die erkannte Verbindung
pub fn decode_input_into(
    buf: &[u8],
    report: &mut NormalizedInputReport,
) -> Result<Connection, CodecError> {
    let connection = Connection::detect(buf)?;
    let offset = connection.offset();
    ensure_len(buf, offset + STATE_LEN)?;
    let data = &buf[offset..];

    for i in 0..4 {
        report.set_axis(i, stick(data[1 + i]));
    }
    report.set_axis(4, decode_unit(data[8]));
    report.set_axis(5, decode_unit(data[9]));

    if let Some(pov) = report.pov_mut(0) {
        *pov = Pov::from_hat(data[5] & 0x0F);
    }

    let face = data[5];
    let shoulder = data[6];
    let system = data[7];
    let buttons = [
        bit(face, 4),
        bit(face, 5),
        bit(face, 6),
        bit(face, 7),
        bit(shoulder, 0),
        bit(shoulder, 1),
        bit(shoulder, 2),
        bit(shoulder, 3),
        bit(shoulder, 4),
        bit(shoulder, 5),
        bit(shoulder, 6),
        bit(shoulder, 7),
        bit(system, 0),
        bit(system, 1),
    ];
    for (i, pressed) in buttons.into_iter().enumerate() {
        report.set_button(i, pressed);
    }

    let misc = data[30];
    report.set_battery(f32::from(misc & 0x0F) / 10.0);
    report.set_usb(bit(misc, 4));

    let gyro = read_i16x3(data, 13);
    let accel = read_i16x3(data, 19);
    report.gyro = Vec3::new(
        -f32::from(gyro[0]),
        -f32::from(gyro[1]),
        f32::from(gyro[2]),
    ) * GYRO_SCALE;
    report.raw_accel = Vec3::new(
        -f32::from(accel[0]),
        -f32::from(accel[1]),
        f32::from(accel[2]),
    ) * ACCEL_SCALE;

    report.set_touchpad_size(TOUCHPAD_SIZE);
    report.set_touch(0, decode_touch(&data[35..39]));
    report.set_touch(1, decode_touch(&data[39..43]));

    report.sanitize();
    Ok(connection)
}

pub fn decode_input(buf: &[u8]) -> Result<NormalizedInputReport, CodecError> {
    let mut report = NormalizedInputReport::new(DS4_LAYOUT);
    decode_input_into(buf, &mut report)?;
    Ok(report)
}

/// Kodiert Rumble und Lightbar in den Output-Report der jeweiligen Verbindung.
///
/// USB: 32 Bytes, Report 0x05. Bluetooth: 78 Bytes ab Report-ID 0x11 mit
/// angehängter CRC-32 (little-endian).
pub fn encode_output(report: &NormalizedOutputReport, connection: Connection) -> Vec<u8> {
    let light = &report.light;
    let payload = [
        encode_unit(report.weak()),
        encode_unit(report.strong()),
        encode_unit(light.red()),
        encode_unit(light.green()),
        encode_unit(light.blue()),
        encode_unit(light.on_time()),
        encode_unit(light.off_time()),
    ];

    match connection {
        Connection::Usb => {
            let mut buf = vec![0u8; USB_OUTPUT_LEN];
            buf[0] = 0x05;
            buf[1] = 0xFF;
            buf[4..11].copy_from_slice(&payload);
            buf
        }
        Connection::Bluetooth => {
            let mut buf = vec![0u8; BT_OUTPUT_LEN];
            buf[0] = 0xA2;
            buf[1] = BT_REPORT_ID;
            buf[2] = 0xC0;
            buf[3] = 0x20;
            buf[4] = 0x07;
            buf[7..14].copy_from_slice(&payload);

            let crc = BT_CRC.checksum(&buf[..BT_CRC_RANGE]);
            buf[BT_CRC_RANGE..].copy_from_slice(&crc.to_le_bytes());
            buf.split_off(1)
        }
    }
}
