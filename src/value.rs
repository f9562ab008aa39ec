//! Parameter values and their blueprint-declared kinds.
//!
//! Node parameters travel as a loosely-shaped name→value bag; the engine
//! validates them against the blueprint's schema at the protocol boundary
//! and packs the supported kinds into shader uniform slots.

use serde::{Deserialize, Serialize};

/// One parameter value. Externally tagged on the wire:
/// `{"scalar": 0.5}`, `{"vec3": [1, 0, 0]}`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamValue {
    Scalar(f32),
    Int(i32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamKind {
    Scalar,
    Int,
    Vec2,
    Vec3,
    Vec4,
    Text,
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Scalar(_) => ParamKind::Scalar,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Vec2(_) => ParamKind::Vec2,
            ParamValue::Vec3(_) => ParamKind::Vec3,
            ParamValue::Vec4(_) => ParamKind::Vec4,
            ParamValue::Text(_) => ParamKind::Text,
        }
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            ParamValue::Scalar(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Scalar(v) if v.is_finite() => Some(v.floor() as i32),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Pack this value into one `vec4<f32>` uniform slot.
    ///
    /// Returns `None` for kinds that have no uniform representation
    /// (currently `Text`); the caller logs and leaves the slot at its
    /// default instead of failing the render.
    pub fn to_uniform_slot(&self) -> Option<[f32; 4]> {
        match self {
            ParamValue::Scalar(v) => Some([*v, 0.0, 0.0, 0.0]),
            ParamValue::Int(v) => Some([*v as f32, 0.0, 0.0, 0.0]),
            ParamValue::Vec2([x, y]) => Some([*x, *y, 0.0, 0.0]),
            ParamValue::Vec3([x, y, z]) => Some([*x, *y, *z, 0.0]),
            ParamValue::Vec4(v) => Some(*v),
            ParamValue::Text(_) => None,
        }
    }
}

/// `Int` widens to `Scalar` (the shader consumes everything as f32 anyway);
/// all other pairs must match exactly.
pub fn value_matches_kind(value: &ParamValue, kind: ParamKind) -> bool {
    value.kind() == kind || (kind == ParamKind::Scalar && value.kind() == ParamKind::Int)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_slot_packing() {
        assert_eq!(
            ParamValue::Scalar(2.5).to_uniform_slot(),
            Some([2.5, 0.0, 0.0, 0.0])
        );
        assert_eq!(
            ParamValue::Vec2([1.0, -1.0]).to_uniform_slot(),
            Some([1.0, -1.0, 0.0, 0.0])
        );
        assert_eq!(ParamValue::Text("x".into()).to_uniform_slot(), None);
    }

    #[test]
    fn int_widens_to_scalar() {
        assert!(value_matches_kind(&ParamValue::Int(3), ParamKind::Scalar));
        assert!(!value_matches_kind(
            &ParamValue::Scalar(3.0),
            ParamKind::Int
        ));
    }

    #[test]
    fn wire_shape_is_externally_tagged_camel_case() {
        let v: ParamValue = serde_json::from_str(r#"{"vec3":[1.0,0.0,0.5]}"#).unwrap();
        assert_eq!(v, ParamValue::Vec3([1.0, 0.0, 0.5]));
        assert_eq!(
            serde_json::to_string(&ParamValue::Scalar(1.0)).unwrap(),
            r#"{"scalar":1.0}"#
        );
    }
}
