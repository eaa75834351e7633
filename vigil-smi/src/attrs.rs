//! Watchable GPU attributes
//!
//! Closed enumeration of the metrics a watch group may sample, with the
//! fixed value type and display unit of each attribute.

use serde::{Deserialize, Serialize};

/// Maximum length of a string-typed attribute value
pub const MAX_WATCH_ATTR_STR: usize = 256;

/// GPU attributes that are watchable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchAttrId {
    GpuClock,
    MemClock,
    MemoryTemp,
    GpuTemp,
    PowerUsage,
    PcieTx,
    PcieRx,
    GpuUtil,
    GpuMemoryUsage,
    EccCorrectTotal,
    EccUncorrectTotal,
    EccSdmaCe,
    EccSdmaUe,
    EccGfxCe,
    EccGfxUe,
    EccMmhubCe,
    EccMmhubUe,
    EccAthubCe,
    EccAthubUe,
    EccPcieBifCe,
    EccPcieBifUe,
    EccHdpCe,
    EccHdpUe,
    EccXgmiWaflCe,
    EccXgmiWaflUe,
    EccDfCe,
    EccDfUe,
    EccSmnCe,
    EccSmnUe,
    EccSemCe,
    EccSemUe,
    EccMp0Ce,
    EccMp0Ue,
    EccMp1Ce,
    EccMp1Ue,
    EccFuseCe,
    EccFuseUe,
    EccUmcCe,
    EccUmcUe,
    EccMcaCe,
    EccMcaUe,
    EccVcnCe,
    EccVcnUe,
    EccJpegCe,
    EccJpegUe,
    EccIhCe,
    EccIhUe,
    EccMpioCe,
    EccMpioUe,
    XgmiNbr0NopTx,
    XgmiNbr0ReqTx,
    XgmiNbr0RespTx,
    XgmiNbr0BeatsTx,
    XgmiNbr1NopTx,
    XgmiNbr1ReqTx,
    XgmiNbr1RespTx,
    XgmiNbr1BeatsTx,
    XgmiNbr0TxThrput,
    XgmiNbr1TxThrput,
    XgmiNbr2TxThrput,
    XgmiNbr3TxThrput,
    XgmiNbr4TxThrput,
    XgmiNbr5TxThrput,
    PcieBandwidth,
}

/// Value type an attribute read yields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValueType {
    Float,
    Long,
    String,
}

impl WatchAttrId {
    /// Fixed value type of this attribute
    pub fn value_type(&self) -> AttrValueType {
        match self {
            WatchAttrId::PowerUsage => AttrValueType::Float,
            _ => AttrValueType::Long,
        }
    }

    /// Fixed display unit of this attribute
    pub fn units(&self) -> &'static str {
        use WatchAttrId::*;
        match self {
            GpuClock | MemClock => "MHz",
            MemoryTemp | GpuTemp => "C",
            PowerUsage => "W",
            PcieTx | PcieRx => "MB/s",
            GpuUtil => "%",
            GpuMemoryUsage => "MB",
            PcieBandwidth => "GB/s",
            XgmiNbr0TxThrput | XgmiNbr1TxThrput | XgmiNbr2TxThrput | XgmiNbr3TxThrput
            | XgmiNbr4TxThrput | XgmiNbr5TxThrput => "B/s",
            // ECC error and XGMI packet counters
            _ => "count",
        }
    }
}

/// Attribute value, dispatched on the tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Float(f32),
    Long(u64),
    Str(String),
}

impl AttrValue {
    pub fn value_type(&self) -> AttrValueType {
        match self {
            AttrValue::Float(_) => AttrValueType::Float,
            AttrValue::Long(_) => AttrValueType::Long,
            AttrValue::Str(_) => AttrValueType::String,
        }
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Float(v) => write!(f, "{:.2}", v),
            AttrValue::Long(v) => write!(f, "{}", v),
            AttrValue::Str(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_are_fixed_per_attribute() {
        assert_eq!(WatchAttrId::GpuClock.units(), "MHz");
        assert_eq!(WatchAttrId::PowerUsage.units(), "W");
        assert_eq!(WatchAttrId::GpuUtil.units(), "%");
        assert_eq!(WatchAttrId::GpuMemoryUsage.units(), "MB");
        assert_eq!(WatchAttrId::EccUmcUe.units(), "count");
        assert_eq!(WatchAttrId::XgmiNbr3TxThrput.units(), "B/s");
    }

    #[test]
    fn attr_value_tag_dispatch() {
        let v = AttrValue::Long(42);
        assert_eq!(v.value_type(), AttrValueType::Long);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"type":"long","value":42}"#);
        let f: AttrValue = serde_json::from_str(r#"{"type":"float","value":1.5}"#).unwrap();
        assert_eq!(f, AttrValue::Float(1.5));
    }
}
