//! Column table describing how each `Pass` attribute is packed

use crate::codec::transforms::{height_to_mm, mm_to_height, NULL_HEIGHT_MM};
use crate::storage::types::*;

/// One packed attribute of a pass
pub struct PassColumn {
    pub name: &'static str,
    pub mask: i64,
    pub native_null: i64,
    pub nullable: bool,
    pub read: fn(&Pass) -> i64,
    pub write: fn(&mut Pass, i64),
}

const ALL_BITS: i64 = -1;
const ENUM_BITS: i64 = 0x0F;

pub static PASS_COLUMNS: [PassColumn; 21] = [
    PassColumn {
        name: "height_mm",
        mask: ALL_BITS,
        native_null: NULL_HEIGHT_MM as i64,
        nullable: true,
        read: |p| height_to_mm(p.height) as i64,
        write: |p, v| p.height = mm_to_height(v as i32),
    },
    PassColumn {
        name: "machine_id",
        mask: ALL_BITS,
        native_null: NULL_MACHINE_ID as i64,
        nullable: true,
        read: |p| p.machine_id as i64,
        write: |p, v| p.machine_id = v as u16,
    },
    PassColumn {
        name: "pass_type",
        mask: ENUM_BITS,
        native_null: 0,
        nullable: false,
        read: |p| p.pass_type.code(),
        write: |p, v| p.pass_type = PassType::from_code(v),
    },
    PassColumn {
        name: "gps_mode",
        mask: ENUM_BITS,
        native_null: GpsMode::NoGps as i64,
        nullable: true,
        read: |p| p.gps_mode.code(),
        write: |p, v| p.gps_mode = GpsMode::from_code(v),
    },
    PassColumn {
        name: "half_pass",
        mask: 0x01,
        native_null: 0,
        nullable: false,
        read: |p| p.half_pass as i64,
        write: |p, v| p.half_pass = v != 0,
    },
    PassColumn {
        name: "cmv",
        mask: ALL_BITS,
        native_null: NULL_CMV as i64,
        nullable: true,
        read: |p| p.cmv as i64,
        write: |p, v| p.cmv = v as i16,
    },
    PassColumn {
        name: "mdp",
        mask: ALL_BITS,
        native_null: NULL_MDP as i64,
        nullable: true,
        read: |p| p.mdp as i64,
        write: |p, v| p.mdp = v as i16,
    },
    PassColumn {
        name: "rmv",
        mask: ALL_BITS,
        native_null: NULL_RMV as i64,
        nullable: true,
        read: |p| p.rmv as i64,
        write: |p, v| p.rmv = v as i16,
    },
    PassColumn {
        name: "temperature",
        mask: ALL_BITS,
        native_null: NULL_TEMPERATURE as i64,
        nullable: true,
        read: |p| p.temperature as i64,
        write: |p, v| p.temperature = v as u16,
    },
    PassColumn {
        name: "machine_speed",
        mask: ALL_BITS,
        native_null: NULL_MACHINE_SPEED as i64,
        nullable: true,
        read: |p| p.machine_speed as i64,
        write: |p, v| p.machine_speed = v as u16,
    },
    PassColumn {
        name: "radio_latency",
        mask: ALL_BITS,
        native_null: NULL_RADIO_LATENCY as i64,
        nullable: true,
        read: |p| p.radio_latency as i64,
        write: |p, v| p.radio_latency = v as u8,
    },
    PassColumn {
        name: "frequency",
        mask: ALL_BITS,
        native_null: NULL_FREQUENCY as i64,
        nullable: true,
        read: |p| p.frequency as i64,
        write: |p, v| p.frequency = v as u16,
    },
    PassColumn {
        name: "amplitude",
        mask: ALL_BITS,
        native_null: NULL_AMPLITUDE as i64,
        nullable: true,
        read: |p| p.amplitude as i64,
        write: |p, v| p.amplitude = v as u16,
    },
    PassColumn {
        name: "design_id",
        mask: ALL_BITS,
        native_null: NULL_DESIGN_ID as i64,
        nullable: true,
        read: |p| p.events.design_id as i64,
        write: |p, v| p.events.design_id = v as i32,
    },
    PassColumn {
        name: "vibration",
        mask: ENUM_BITS,
        native_null: VibrationState::Invalid as i64,
        nullable: true,
        read: |p| p.events.vibration.code(),
        write: |p, v| p.events.vibration = VibrationState::from_code(v),
    },
    PassColumn {
        name: "automatics",
        mask: ENUM_BITS,
        native_null: AutomaticsMode::Unknown as i64,
        nullable: true,
        read: |p| p.events.automatics.code(),
        write: |p, v| p.events.automatics = AutomaticsMode::from_code(v),
    },
    PassColumn {
        name: "gps_accuracy",
        mask: ENUM_BITS,
        native_null: GpsAccuracy::Unknown as i64,
        nullable: true,
        read: |p| p.events.gps_accuracy.code(),
        write: |p, v| p.events.gps_accuracy = GpsAccuracy::from_code(v),
    },
    PassColumn {
        name: "gps_tolerance",
        mask: ALL_BITS,
        native_null: NULL_GPS_TOLERANCE as i64,
        nullable: true,
        read: |p| p.events.gps_tolerance as i64,
        write: |p, v| p.events.gps_tolerance = v as u16,
    },
    PassColumn {
        name: "layer_id",
        mask: ALL_BITS,
        native_null: NULL_LAYER_ID as i64,
        nullable: true,
        read: |p| p.events.layer_id as i64,
        write: |p, v| p.events.layer_id = v as u16,
    },
    PassColumn {
        name: "target_cmv",
        mask: ALL_BITS,
        native_null: NULL_TARGET_CMV as i64,
        nullable: true,
        read: |p| p.events.target_cmv as i64,
        write: |p, v| p.events.target_cmv = v as i16,
    },
    PassColumn {
        name: "target_pass_count",
        mask: ALL_BITS,
        native_null: NULL_TARGET_PASS_COUNT as i64,
        nullable: true,
        read: |p| p.events.target_pass_count as i64,
        write: |p, v| p.events.target_pass_count = v as u16,
    },
];
