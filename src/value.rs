use std::collections::BTreeMap;

/// Operation parameters, keyed by the protocol's one-byte parameter codes.
pub type Params = BTreeMap<u8, Value>;
/// Small integer-keyed structure used inside event payloads (RPC, instantiate, serialize batches).
pub type Table = BTreeMap<i16, Value>;
/// String-keyed custom properties of actors and rooms.
pub type Properties = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
    pub fn distance_squared(&self, other: &Vector3) -> f32 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        dx * dx + dy * dy + dz * dz
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
    /// Rotation around the Y axis, handy for tests and demos.
    pub fn from_yaw_degrees(degrees: f32) -> Self {
        let half = degrees.to_radians() / 2.0;
        Self::new(0.0, half.sin(), 0.0, half.cos())
    }
    /// Angle in degrees between two rotations.
    pub fn angle_degrees(&self, other: &Quaternion) -> f32 {
        let dot = self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w;
        let dot = dot.abs().min(1.0);
        (2.0 * dot.acos()).to_degrees()
    }
}

/// A dynamically typed payload element.
///
/// RPC arguments, instantiation data, custom properties and serialized view fields are all
/// vectors or maps of `Value`s. Each variant has its own byte encoding (see [`Bytes`](crate::bytes::Bytes)).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Vector3(Vector3),
    Quaternion(Quaternion),
    Array(Vec<Value>),
    IntArray(Vec<i32>),
    Table(Table),
    Dict(Properties),
    /// Application-defined type, already serialized by the host.
    Custom { code: u8, data: Vec<u8> },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    /// Any integral variant widened to `i32`.
    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Value::Byte(v) => Some(v as i32),
            Value::Short(v) => Some(v as i32),
            Value::Int(v) => Some(v),
            Value::Long(v) => i32::try_from(v).ok(),
            _ => None,
        }
    }
    pub fn as_short(&self) -> Option<i16> {
        self.as_int().and_then(|v| i16::try_from(v).ok())
    }
    pub fn as_byte(&self) -> Option<u8> {
        self.as_int().and_then(|v| u8::try_from(v).ok())
    }
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_vector3(&self) -> Option<Vector3> {
        match *self {
            Value::Vector3(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_quaternion(&self) -> Option<Quaternion> {
        match *self {
            Value::Quaternion(q) => Some(q),
            _ => None,
        }
    }
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
    pub fn as_int_array(&self) -> Option<&[i32]> {
        match self {
            Value::IntArray(items) => Some(items),
            _ => None,
        }
    }
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }
    pub fn as_dict(&self) -> Option<&Properties> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
    pub fn into_table(self) -> Option<Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }
    pub fn into_dict(self) -> Option<Properties> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

impl_from! {
    bool => Bool,
    u8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => String,
    Vector3 => Vector3,
    Quaternion => Quaternion,
    Vec<Value> => Array,
    Vec<i32> => IntArray,
    Table => Table,
    Properties => Dict,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Merges `update` into `target`; a `Null` value deletes the key.
pub fn merge_properties(target: &mut Properties, update: &Properties) {
    for (key, value) in update {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
