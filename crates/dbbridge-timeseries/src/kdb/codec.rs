//! kdb+ IPC wire format
//!
//! A message is an 8-byte header (endianness, message type, compression flag,
//! reserved, total length) followed by one serialized q object. Queries are
//! sent as char vectors; responses decode into [`KObject`].

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde_json::{json, Map, Value};
use std::io::{self, Cursor, Read};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Async = 0,
    Sync = 1,
    Response = 2,
}

impl MessageType {
    fn from_byte(b: u8) -> io::Result<Self> {
        match b {
            0 => Ok(MessageType::Async),
            1 => Ok(MessageType::Sync),
            2 => Ok(MessageType::Response),
            other => Err(invalid(format!("unknown message type {}", other))),
        }
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub little_endian: bool,
    pub msg_type: MessageType,
    pub compressed: bool,
    pub length: usize,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> io::Result<Self> {
        let little_endian = bytes[0] == 1;
        let length = if little_endian {
            LittleEndian::read_i32(&bytes[4..8])
        } else {
            BigEndian::read_i32(&bytes[4..8])
        };
        if length < HEADER_LEN as i32 {
            return Err(invalid(format!("message length {} too short", length)));
        }
        Ok(Header {
            little_endian,
            msg_type: MessageType::from_byte(bytes[1])?,
            compressed: bytes[2] == 1,
            length: length as usize,
        })
    }
}

/// Scalar q value
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Bool(bool),
    Guid([u8; 16]),
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Real(f32),
    Float(f64),
    Char(u8),
    Symbol(String),
    Timestamp(i64),
    Month(i32),
    Date(i32),
    Datetime(f64),
    Timespan(i64),
    Minute(i32),
    Second(i32),
    Time(i32),
}

/// Any q object this codec understands
#[derive(Debug, Clone, PartialEq)]
pub enum KObject {
    Atom(Atom),
    /// Typed vector; char vectors decode to [`KObject::Chars`]
    Vector(Vec<Atom>),
    Chars(String),
    List(Vec<KObject>),
    Dict(Box<KObject>, Box<KObject>),
    Table(Vec<String>, Vec<KObject>),
    /// Lambda source
    Function(String),
    /// Generic null `(::)` and other unary primitives
    Null,
}

const K_ERROR: i8 = -128;
const K_LIST: i8 = 0;
const K_CHAR: i8 = 10;
const K_SYMBOL: i8 = 11;
const K_TABLE: i8 = 98;
const K_DICT: i8 = 99;
const K_LAMBDA: i8 = 100;
const K_UNARY: i8 = 101;
const K_SORTED_DICT: i8 = 127;

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Frame a q expression as a message of `msg_type`
pub fn encode_query(msg_type: MessageType, query: &str) -> Vec<u8> {
    let payload_len = 1 + 1 + 4 + query.len();
    let mut buf = Vec::with_capacity(HEADER_LEN + payload_len);
    buf.push(1); // little endian
    buf.push(msg_type as u8);
    buf.push(0);
    buf.push(0);
    // Writes into a Vec are infallible
    let _ = buf.write_i32::<LittleEndian>((HEADER_LEN + payload_len) as i32);
    let _ = buf.write_i8(K_CHAR);
    buf.push(0); // attributes
    let _ = buf.write_i32::<LittleEndian>(query.len() as i32);
    buf.extend_from_slice(query.as_bytes());
    buf
}

/// Login request: `user:password` followed by the capability byte and a terminator
pub fn encode_login(username: Option<&str>, password: Option<&str>) -> Vec<u8> {
    let mut buf = match (username, password) {
        (Some(user), Some(pass)) => format!("{}:{}", user, pass).into_bytes(),
        (Some(user), None) => user.as_bytes().to_vec(),
        _ => Vec::new(),
    };
    buf.push(3);
    buf.push(0);
    buf
}

/// Decode one full message (header included). A q error becomes `Ok(Err(message))`.
pub fn decode_message(message: &[u8]) -> io::Result<std::result::Result<KObject, String>> {
    let header_bytes: [u8; HEADER_LEN] = message
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| invalid("truncated header"))?;
    let header = Header::parse(&header_bytes)?;

    let inflated;
    let body = if header.compressed {
        inflated = decompress(message, header.little_endian)?;
        &inflated[HEADER_LEN..]
    } else {
        message
            .get(HEADER_LEN..header.length)
            .ok_or_else(|| invalid("truncated message"))?
    };

    let mut cursor = Cursor::new(body);
    if header.little_endian {
        Decoder::<LittleEndian>::new(&mut cursor).object()
    } else {
        Decoder::<BigEndian>::new(&mut cursor).object()
    }
}

/// A two-byte back-reference yields at most 257 bytes
const MAX_EXPANSION: usize = 129;

/// Inflate a compressed message; the result carries a fresh 8-byte header slot
pub fn decompress(message: &[u8], little_endian: bool) -> io::Result<Vec<u8>> {
    let size_bytes = message
        .get(HEADER_LEN..HEADER_LEN + 4)
        .ok_or_else(|| invalid("truncated compressed message"))?;
    let size = if little_endian {
        LittleEndian::read_i32(size_bytes)
    } else {
        BigEndian::read_i32(size_bytes)
    };
    if size < HEADER_LEN as i32 {
        return Err(invalid("invalid uncompressed size"));
    }

    let size = size as usize;
    let packed = message.len().saturating_sub(HEADER_LEN + 4);
    if size - HEADER_LEN > packed.saturating_mul(MAX_EXPANSION) {
        return Err(invalid(format!(
            "uncompressed size {} exceeds what {} compressed bytes can hold",
            size, packed
        )));
    }
    let mut dst = vec![0u8; size];
    let mut table = [0usize; 256];
    let src = |i: usize| message.get(i).copied().ok_or_else(|| invalid("truncated compressed data"));

    let (mut s, mut p, mut d) = (HEADER_LEN, HEADER_LEN, HEADER_LEN + 4);
    let mut flags = 0u8;
    let mut bit = 0u16;
    while s < size {
        if bit == 0 {
            flags = src(d)?;
            d += 1;
            bit = 1;
        }
        let mut run = 0usize;
        if u16::from(flags) & bit != 0 {
            let mut r = table[src(d)? as usize];
            d += 1;
            if s + 2 > size || r + 2 > size {
                return Err(invalid("corrupt compressed data"));
            }
            dst[s] = dst[r];
            s += 1;
            r += 1;
            dst[s] = dst[r];
            s += 1;
            r += 1;
            run = src(d)? as usize;
            d += 1;
            if s + run > size || r + run > size {
                return Err(invalid("corrupt compressed data"));
            }
            for m in 0..run {
                dst[s + m] = dst[r + m];
            }
        } else {
            dst[s] = src(d)?;
            s += 1;
            d += 1;
        }
        while p + 1 < s {
            table[(dst[p] ^ dst[p + 1]) as usize] = p;
            p += 1;
        }
        if u16::from(flags) & bit != 0 {
            s += run;
            p = s;
        }
        bit <<= 1;
        if bit == 256 {
            bit = 0;
        }
    }
    Ok(dst)
}

struct Decoder<'a, 'b, B: ByteOrder> {
    cursor: &'a mut Cursor<&'b [u8]>,
    _order: std::marker::PhantomData<B>,
}

impl<'a, 'b, B: ByteOrder> Decoder<'a, 'b, B> {
    fn new(cursor: &'a mut Cursor<&'b [u8]>) -> Self {
        Self {
            cursor,
            _order: std::marker::PhantomData,
        }
    }

    fn object(&mut self) -> io::Result<std::result::Result<KObject, String>> {
        let kind = self.cursor.read_i8()?;
        if kind == K_ERROR {
            return Ok(Err(self.symbol()?));
        }
        self.body(kind).map(Ok)
    }

    fn nested(&mut self) -> io::Result<KObject> {
        let kind = self.cursor.read_i8()?;
        if kind == K_ERROR {
            return Err(invalid(format!("nested error: {}", self.symbol()?)));
        }
        self.body(kind)
    }

    fn body(&mut self, kind: i8) -> io::Result<KObject> {
        match kind {
            k if k < 0 => self.atom(-k).map(KObject::Atom),
            K_LIST => {
                let len = self.length()?;
                (0..len)
                    .map(|_| self.nested())
                    .collect::<io::Result<Vec<_>>>()
                    .map(KObject::List)
            }
            K_CHAR => {
                let len = self.length()?;
                let mut bytes = vec![0u8; len];
                self.cursor.read_exact(&mut bytes)?;
                Ok(KObject::Chars(String::from_utf8_lossy(&bytes).into_owned()))
            }
            1..=19 => {
                let len = self.length()?;
                (0..len)
                    .map(|_| self.atom(kind))
                    .collect::<io::Result<Vec<_>>>()
                    .map(KObject::Vector)
            }
            K_TABLE => {
                self.cursor.read_u8()?; // attributes
                match self.nested()? {
                    KObject::Dict(keys, values) => {
                        let names = match *keys {
                            KObject::Vector(atoms) => atoms
                                .into_iter()
                                .map(|a| match a {
                                    Atom::Symbol(s) => s,
                                    other => format!("{:?}", other),
                                })
                                .collect(),
                            _ => return Err(invalid("table columns must be symbols")),
                        };
                        let columns = match *values {
                            KObject::List(columns) => columns,
                            other => vec![other],
                        };
                        Ok(KObject::Table(names, columns))
                    }
                    _ => Err(invalid("table must wrap a dictionary")),
                }
            }
            K_DICT | K_SORTED_DICT => {
                let keys = self.nested()?;
                let values = self.nested()?;
                Ok(KObject::Dict(Box::new(keys), Box::new(values)))
            }
            K_LAMBDA => {
                let _context = self.symbol()?;
                match self.nested()? {
                    KObject::Chars(source) => Ok(KObject::Function(source)),
                    _ => Err(invalid("lambda body must be a char vector")),
                }
            }
            K_UNARY => {
                self.cursor.read_u8()?;
                Ok(KObject::Null)
            }
            other => Err(invalid(format!("unsupported q type {}", other))),
        }
    }

    /// Attribute byte then element count, never more than the bytes left
    fn length(&mut self) -> io::Result<usize> {
        self.cursor.read_u8()?;
        let len = self.cursor.read_i32::<B>()?;
        let len = usize::try_from(len).map_err(|_| invalid(format!("negative length {}", len)))?;
        let remaining = self
            .cursor
            .get_ref()
            .len()
            .saturating_sub(self.cursor.position() as usize);
        if len > remaining {
            return Err(invalid(format!(
                "length {} exceeds the {} bytes left in the message",
                len, remaining
            )));
        }
        Ok(len)
    }

    fn symbol(&mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        loop {
            match self.cursor.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn atom(&mut self, kind: i8) -> io::Result<Atom> {
        if kind == K_SYMBOL {
            return self.symbol().map(Atom::Symbol);
        }
        let c = &mut *self.cursor;
        Ok(match kind {
            1 => Atom::Bool(c.read_u8()? != 0),
            2 => {
                let mut guid = [0u8; 16];
                c.read_exact(&mut guid)?;
                Atom::Guid(guid)
            }
            4 => Atom::Byte(c.read_u8()?),
            5 => Atom::Short(c.read_i16::<B>()?),
            6 => Atom::Int(c.read_i32::<B>()?),
            7 => Atom::Long(c.read_i64::<B>()?),
            8 => Atom::Real(c.read_f32::<B>()?),
            9 => Atom::Float(c.read_f64::<B>()?),
            10 => Atom::Char(c.read_u8()?),
            12 => Atom::Timestamp(c.read_i64::<B>()?),
            13 => Atom::Month(c.read_i32::<B>()?),
            14 => Atom::Date(c.read_i32::<B>()?),
            15 => Atom::Datetime(c.read_f64::<B>()?),
            16 => Atom::Timespan(c.read_i64::<B>()?),
            17 => Atom::Minute(c.read_i32::<B>()?),
            18 => Atom::Second(c.read_i32::<B>()?),
            19 => Atom::Time(c.read_i32::<B>()?),
            other => return Err(invalid(format!("unsupported atom type {}", -other))),
        })
    }
}

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Temporal offset from 2000.01.01; out-of-range values (infinities) become null
fn since_epoch(offset: Duration, format: &str) -> Value {
    epoch()
        .checked_add_signed(offset)
        .map(|ts| json!(ts.format(format).to_string()))
        .unwrap_or(Value::Null)
}

fn float_json(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn clock(ms: i64) -> String {
    let (h, rest) = (ms / 3_600_000, ms % 3_600_000);
    let (m, rest) = (rest / 60_000, rest % 60_000);
    format!("{:02}:{:02}:{:02}.{:03}", h, m, rest / 1000, rest % 1000)
}

impl Atom {
    pub fn to_json(&self) -> Value {
        match *self {
            Atom::Bool(b) => json!(b),
            Atom::Guid(ref g) => {
                let hex: String = g.iter().map(|b| format!("{:02x}", b)).collect();
                json!(format!(
                    "{}-{}-{}-{}-{}",
                    &hex[0..8],
                    &hex[8..12],
                    &hex[12..16],
                    &hex[16..20],
                    &hex[20..32]
                ))
            }
            Atom::Byte(b) => json!(b),
            Atom::Short(i16::MIN) | Atom::Int(i32::MIN) | Atom::Long(i64::MIN) => Value::Null,
            Atom::Short(v) => json!(v),
            Atom::Int(v) => json!(v),
            Atom::Long(v) => json!(v),
            Atom::Real(v) => float_json(f64::from(v)),
            Atom::Float(v) => float_json(v),
            Atom::Char(c) => json!((c as char).to_string()),
            Atom::Symbol(ref s) => json!(s),
            Atom::Timestamp(i64::MIN)
            | Atom::Timespan(i64::MIN)
            | Atom::Month(i32::MIN)
            | Atom::Date(i32::MIN)
            | Atom::Minute(i32::MIN)
            | Atom::Second(i32::MIN)
            | Atom::Time(i32::MIN) => Value::Null,
            Atom::Timestamp(ns) => since_epoch(Duration::nanoseconds(ns), "%Y-%m-%dT%H:%M:%S%.9f"),
            Atom::Month(m) => {
                let months = 2000 * 12 + i64::from(m);
                json!(format!("{:04}-{:02}", months.div_euclid(12), months.rem_euclid(12) + 1))
            }
            Atom::Date(days) => since_epoch(Duration::days(i64::from(days)), "%Y-%m-%d"),
            Atom::Datetime(days) if days.is_nan() => Value::Null,
            Atom::Datetime(days) => since_epoch(
                Duration::milliseconds((days * 86_400_000.0).round() as i64),
                "%Y-%m-%dT%H:%M:%S%.3f",
            ),
            Atom::Timespan(ns) => {
                let sign = if ns < 0 { "-" } else { "" };
                let ns = ns.unsigned_abs();
                let days = ns / 86_400_000_000_000;
                let rest = ns % 86_400_000_000_000;
                json!(format!(
                    "{}{}D{}{:06}",
                    sign,
                    days,
                    clock((rest / 1_000_000) as i64),
                    rest % 1_000_000
                ))
            }
            Atom::Minute(m) => json!(format!("{:02}:{:02}", m / 60, m % 60)),
            Atom::Second(s) => json!(format!("{:02}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)),
            Atom::Time(ms) => json!(clock(i64::from(ms))),
        }
    }
}

impl KObject {
    /// Items of a vector-like object
    fn items(&self) -> Vec<Value> {
        match self {
            KObject::Vector(atoms) => atoms.iter().map(Atom::to_json).collect(),
            KObject::Chars(s) => s.chars().map(|c| json!(c.to_string())).collect(),
            KObject::List(items) => items.iter().map(KObject::to_json).collect(),
            other => vec![other.to_json()],
        }
    }

    /// Table as row objects
    fn rows(names: &[String], columns: &[KObject]) -> Vec<Map<String, Value>> {
        let columns: Vec<Vec<Value>> = columns.iter().map(KObject::items).collect();
        let count = columns.iter().map(Vec::len).max().unwrap_or(0);
        (0..count)
            .map(|i| {
                names
                    .iter()
                    .zip(&columns)
                    .map(|(name, column)| (name.clone(), column.get(i).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect()
    }

    pub fn to_json(&self) -> Value {
        match self {
            KObject::Atom(atom) => atom.to_json(),
            KObject::Vector(_) | KObject::List(_) => Value::Array(self.items()),
            KObject::Chars(s) | KObject::Function(s) => json!(s),
            KObject::Table(names, columns) => Value::Array(
                Self::rows(names, columns)
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            ),
            KObject::Dict(keys, values) => match (keys.as_ref(), values.as_ref()) {
                // keyed table
                (KObject::Table(kn, kc), KObject::Table(vn, vc)) => Value::Array(
                    Self::rows(kn, kc)
                        .into_iter()
                        .zip(Self::rows(vn, vc))
                        .map(|(mut key, value)| {
                            key.extend(value);
                            Value::Object(key)
                        })
                        .collect(),
                ),
                (keys, values) => {
                    let keys = keys.items();
                    let values = values.items();
                    if keys.iter().all(Value::is_string) {
                        Value::Object(
                            keys.into_iter()
                                .zip(values)
                                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
                                .collect(),
                        )
                    } else {
                        json!({ "keys": keys, "values": values })
                    }
                }
            },
            KObject::Null => Value::Null,
        }
    }
}

/// Readable name of a `meta` type character
pub fn type_name(code: char) -> &'static str {
    match code {
        'b' => "boolean",
        'g' => "guid",
        'x' => "byte",
        'h' => "short",
        'i' => "int",
        'j' => "long",
        'e' => "real",
        'f' => "float",
        'c' => "char",
        's' => "symbol",
        'p' => "timestamp",
        'm' => "month",
        'd' => "date",
        'z' => "datetime",
        'n' => "timespan",
        'u' => "minute",
        'v' => "second",
        't' => "time",
        ' ' => "list",
        c if c.is_ascii_uppercase() => "vector",
        _ => "unknown",
    }
}
