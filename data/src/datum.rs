use half::f16;
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum DatumType {
    Bool,
    U8,
    I8,
    I32,
    F16,
    F32,
}

impl DatumType {
    pub fn size_of(&self) -> usize {
        match self {
            DatumType::Bool | DatumType::U8 | DatumType::I8 => 1,
            DatumType::F16 => 2,
            DatumType::I32 | DatumType::F32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DatumType::F16 | DatumType::F32)
    }

    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    /// Brings `v` to the closest value representable in this datum type.
    pub fn round(&self, v: f32) -> f32 {
        match self {
            DatumType::F32 => v,
            DatumType::F16 => f16::from_f32(v).to_f32(),
            DatumType::I32 => (v as i32) as f32,
            DatumType::I8 => (v as i8) as f32,
            DatumType::U8 => (v as u8) as f32,
            DatumType::Bool => (v != 0.0) as u8 as f32,
        }
    }

    pub(crate) fn write_bytes(&self, v: f32, out: &mut Vec<u8>) {
        match self {
            DatumType::F32 => out.extend_from_slice(&v.to_le_bytes()),
            DatumType::F16 => out.extend_from_slice(&f16::from_f32(v).to_bits().to_le_bytes()),
            DatumType::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
            DatumType::I8 => out.push((v as i8) as u8),
            DatumType::U8 | DatumType::Bool => out.push(v as u8),
        }
    }

    pub(crate) fn read_bytes(&self, bytes: &[u8]) -> f32 {
        match self {
            DatumType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            DatumType::F16 => f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])).to_f32(),
            DatumType::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            DatumType::I8 => bytes[0] as i8 as f32,
            DatumType::U8 | DatumType::Bool => bytes[0] as f32,
        }
    }
}

impl fmt::Display for DatumType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DatumType::Bool => "bool",
            DatumType::U8 => "u8",
            DatumType::I8 => "i8",
            DatumType::I32 => "i32",
            DatumType::F16 => "f16",
            DatumType::F32 => "f32",
        };
        write!(fmt, "{s}")
    }
}
