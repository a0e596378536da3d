//! Normative type helpers
//!
//! Builds the standard `NTScalar`/`NTScalarArray` structures, along with the common
//! `alarm_t`, `time_t`, `display_t` and `control_t` sub-structures.

use std::time::{SystemTime, UNIX_EPOCH};

use super::{PvStructure, PvValue, StructureBuilder};

pub const NT_SCALAR: &str = "epics:nt/NTScalar:1.0";
pub const NT_SCALAR_ARRAY: &str = "epics:nt/NTScalarArray:1.0";

/// Alarm severity as carried in `alarm_t`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AlarmSeverity {
    #[default]
    None = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
    Undefined = 4,
}

pub fn alarm_t(severity: AlarmSeverity, status: i32, message: &str) -> PvStructure {
    StructureBuilder::new("alarm_t")
        .add("severity", PvValue::Int(severity as i32))
        .add("status", PvValue::Int(status))
        .add("message", PvValue::String(message.to_string()))
        .build()
}

pub fn time_t(time: SystemTime) -> PvStructure {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    StructureBuilder::new("time_t")
        .add("secondsPastEpoch", PvValue::Long(since_epoch.as_secs() as i64))
        .add("nanoseconds", PvValue::Int(since_epoch.subsec_nanos() as i32))
        .add("userTag", PvValue::Int(0))
        .build()
}

/// Display metadata for `display_t`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Display {
    pub limit_low: f64,
    pub limit_high: f64,
    pub description: String,
    pub format: String,
    pub units: String,
}

impl Display {
    fn to_structure(&self) -> PvStructure {
        StructureBuilder::new("display_t")
            .add("limitLow", PvValue::Double(self.limit_low))
            .add("limitHigh", PvValue::Double(self.limit_high))
            .add("description", PvValue::String(self.description.clone()))
            .add("format", PvValue::String(self.format.clone()))
            .add("units", PvValue::String(self.units.clone()))
            .build()
    }
}

/// Control limits for `control_t`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Control {
    pub limit_low: f64,
    pub limit_high: f64,
    pub min_step: f64,
}

/// Builder for an `NTScalar` or `NTScalarArray` value
#[derive(Debug, Clone)]
pub struct NtScalar {
    value: PvValue,
    descriptor: Option<String>,
    alarm: bool,
    time: bool,
    display: Option<Display>,
    control: Option<Control>,
}

impl NtScalar {
    pub fn new(value: PvValue) -> Self {
        NtScalar {
            value,
            descriptor: None,
            alarm: false,
            time: false,
            display: None,
            control: None,
        }
    }
    pub fn descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.descriptor = Some(descriptor.into());
        self
    }
    pub fn alarm(mut self) -> Self {
        self.alarm = true;
        self
    }
    pub fn timestamp(mut self) -> Self {
        self.time = true;
        self
    }
    pub fn display(mut self, display: Display) -> Self {
        self.display = Some(display);
        self
    }
    pub fn control(mut self, control: Control) -> Self {
        self.control = Some(control);
        self
    }

    pub fn build(self) -> PvStructure {
        let type_id = match self.value.field_desc() {
            super::FieldDesc::ScalarArray(_) => NT_SCALAR_ARRAY,
            _ => NT_SCALAR,
        };
        let mut builder = StructureBuilder::new(type_id).add("value", self.value);
        if let Some(descriptor) = self.descriptor {
            builder = builder.add("descriptor", PvValue::String(descriptor));
        }
        if self.alarm {
            builder = builder.add_structure("alarm", alarm_t(AlarmSeverity::None, 0, ""));
        }
        if self.time {
            builder = builder.add_structure("timeStamp", time_t(SystemTime::now()));
        }
        if let Some(display) = self.display {
            builder = builder.add_structure("display", display.to_structure());
        }
        if let Some(control) = self.control {
            builder = builder.add_structure(
                "control",
                StructureBuilder::new("control_t")
                    .add("limitLow", PvValue::Double(control.limit_low))
                    .add("limitHigh", PvValue::Double(control.limit_high))
                    .add("minStep", PvValue::Double(control.min_step))
                    .build(),
            );
        }
        builder.build()
    }
}

/// Replace the `timeStamp` of a structure, if it has one
pub fn set_timestamp(structure: &mut PvStructure, time: SystemTime) {
    if let Some(PvValue::Structure(stamp)) = structure.get_mut("timeStamp") {
        *stamp = time_t(time);
    }
}

/// Replace the `alarm` of a structure, if it has one
pub fn set_alarm(structure: &mut PvStructure, severity: AlarmSeverity, status: i32, message: &str) {
    if let Some(PvValue::Structure(alarm)) = structure.get_mut("alarm") {
        *alarm = alarm_t(severity, status, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn build_nt_scalar() {
        let value = NtScalar::new(PvValue::Double(3.5))
            .descriptor("A ramp")
            .alarm()
            .timestamp()
            .build();
        assert_eq!(value.type_id, NT_SCALAR);
        assert_eq!(value.get("value"), Some(&PvValue::Double(3.5)));
        assert_eq!(value.locate("alarm.severity"), Some(&PvValue::Int(0)));
        assert!(value.locate("timeStamp.secondsPastEpoch").is_some());
        assert!(value.get("display").is_none());

        let array = NtScalar::new(PvValue::IntArray(vec![1, 2])).build();
        assert_eq!(array.type_id, NT_SCALAR_ARRAY);
    }

    #[test]
    fn stamp_update_keeps_shape() {
        let mut value = NtScalar::new(PvValue::Int(1)).alarm().timestamp().build();
        let original = value.clone();
        set_timestamp(&mut value, UNIX_EPOCH + Duration::from_secs(100));
        set_alarm(&mut value, AlarmSeverity::Major, 3, "HIHI");
        assert!(original.same_shape(&value));
        assert_eq!(
            value.locate("timeStamp.secondsPastEpoch"),
            Some(&PvValue::Long(100))
        );
        assert_eq!(value.locate("alarm.message"), Some(&PvValue::String("HIHI".into())));
    }
}
