//! Reader and writer for NI TDMS trace containers.
//!
//! The DAQmx disk-logging feature streams analog-input samples into a TDMS file: a sequence of
//! segments, each with a 28-byte lead-in, an optional metadata block (object paths, raw data
//! indices and properties) and a raw data block. Objects are addressed by paths of the form
//! `/'group'/'channel'`.
//!
//! ## Reading
//!
//! [`TdmsFile::open`] parses a whole file eagerly and exposes its groups and channels, with every
//! channel's samples converted to `f64`. Supported are:
//! - incremental metadata (objects carried over from the previous segment, raw data indices
//!   reused with the "same as previous" marker),
//! - several raw data chunks per segment,
//! - interleaved and non-interleaved raw data,
//! - little- and big-endian segments,
//! - DAQmx raw data (format-changing and digital-line scalers), scaled to engineering units
//!   with the `NI_Scale[n]` linear and polynomial scaling properties the logger stores.
//!
//! [`TdmsChannel::time_track`] rebuilds the per-sample time vector from the `wf_start_offset` and
//! `wf_increment` waveform properties.
//!
//! ## Writing
//!
//! [`TdmsWriter`] produces single-segment, little-endian files with `f64` channel data. The
//! simulated device uses it to emulate DAQmx logging.

use indexmap::IndexMap;
use std::fmt;
use std::fs;
use std::path::Path;

const TDMS_TAG: &[u8; 4] = b"TDSm";
const LEAD_IN_LEN: usize = 28;
const TDMS_VERSION: u32 = 4713;
const TDMS_VERSION_LEGACY: u32 = 4712;

const TOC_META_DATA: u32 = 1 << 1;
const TOC_NEW_OBJ_LIST: u32 = 1 << 2;
const TOC_RAW_DATA: u32 = 1 << 3;
const TOC_INTERLEAVED_DATA: u32 = 1 << 5;
const TOC_BIG_ENDIAN: u32 = 1 << 6;
const TOC_DAQMX_RAW_DATA: u32 = 1 << 7;

const RAW_INDEX_NO_DATA: u32 = 0xFFFF_FFFF;
const RAW_INDEX_MATCHES_PREVIOUS: u32 = 0x0000_0000;
const RAW_INDEX_FORMAT_CHANGING_SCALER: u32 = 0x0000_1269;
const RAW_INDEX_DIGITAL_LINE_SCALER: u32 = 0x0000_126A;
const DAQMX_RAW_DATA_TYPE: u32 = 0xFFFF_FFFF;

const SCALE_RAW_INPUT: u64 = 0xFFFF_FFFF;
// Scaler record sizes in a DAQmx raw data index
const FORMAT_CHANGING_SCALER_LEN: usize = 20;
const DIGITAL_LINE_SCALER_LEN: usize = 17;

/// Failure to parse or write a TDMS container.
#[derive(thiserror::Error, Debug)]
pub enum TdmsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Expected segment tag TDSm at byte {offset}")]
    BadTag { offset: usize },

    #[error("Unsupported TDMS version {0}")]
    UnsupportedVersion(u32),

    #[error("Unexpected end of data at byte {offset} (needed {needed} more bytes)")]
    Truncated { offset: usize, needed: usize },

    #[error("Unsupported data type code {0:#x}")]
    UnsupportedDataType(u32),

    #[error("Object path {0:?} is malformed")]
    BadPath(String),

    #[error("Object {path} reuses a raw data index it never declared")]
    MissingPreviousIndex { path: String },

    #[error("{0}")]
    Unsupported(String),
}

type Result<T> = std::result::Result<T, TdmsError>;

/// TDMS element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    Bool,
    Timestamp,
}

impl DataType {
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            0x01 => DataType::I8,
            0x02 => DataType::I16,
            0x03 => DataType::I32,
            0x04 => DataType::I64,
            0x05 => DataType::U8,
            0x06 => DataType::U16,
            0x07 => DataType::U32,
            0x08 => DataType::U64,
            0x09 | 0x19 => DataType::F32,
            0x0A | 0x1A => DataType::F64,
            0x20 => DataType::String,
            0x21 => DataType::Bool,
            0x44 => DataType::Timestamp,
            _ => return Err(TdmsError::UnsupportedDataType(code)),
        })
    }

    /// Type codes used inside DAQmx scalers, which differ from the TDMS ones.
    fn from_daqmx_code(code: u32) -> Result<Self> {
        Ok(match code {
            0 => DataType::U8,
            1 => DataType::I8,
            2 => DataType::U16,
            3 => DataType::I16,
            4 => DataType::U32,
            5 => DataType::I32,
            6 => DataType::U64,
            7 => DataType::I64,
            8 => DataType::F32,
            9 => DataType::F64,
            0xFFFF_FFFF => DataType::Timestamp,
            _ => return Err(TdmsError::UnsupportedDataType(code)),
        })
    }

    pub fn code(&self) -> u32 {
        match self {
            DataType::I8 => 0x01,
            DataType::I16 => 0x02,
            DataType::I32 => 0x03,
            DataType::I64 => 0x04,
            DataType::U8 => 0x05,
            DataType::U16 => 0x06,
            DataType::U32 => 0x07,
            DataType::U64 => 0x08,
            DataType::F32 => 0x09,
            DataType::F64 => 0x0A,
            DataType::String => 0x20,
            DataType::Bool => 0x21,
            DataType::Timestamp => 0x44,
        }
    }

    /// Size in bytes of one element, `None` for variable-size strings.
    pub fn size(&self) -> Option<usize> {
        match self {
            DataType::I8 | DataType::U8 | DataType::Bool => Some(1),
            DataType::I16 | DataType::U16 => Some(2),
            DataType::I32 | DataType::U32 | DataType::F32 => Some(4),
            DataType::I64 | DataType::U64 | DataType::F64 => Some(8),
            DataType::Timestamp => Some(16),
            DataType::String => None,
        }
    }
}

/// LabVIEW timestamp: seconds since 1904-01-01 UTC plus positive fractions of 2^-64 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdmsTimestamp {
    pub seconds: i64,
    pub fractions: u64,
}

impl TdmsTimestamp {
    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + self.fractions as f64 / 2f64.powi(64)
    }
}

/// Value of an object property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bool(bool),
    Timestamp(TdmsTimestamp),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Int(v) => Some(*v as f64),
            PropertyValue::UInt(v) => Some(*v as f64),
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Bool(v) => Some(if *v { 1. } else { 0. }),
            PropertyValue::Timestamp(ts) => Some(ts.as_secs_f64()),
            PropertyValue::String(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::Int(v) if *v >= 0 => Some(*v as u64),
            PropertyValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::String(v) => write!(f, "{}", v),
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Timestamp(ts) => write!(f, "{}s+{}", ts.seconds, ts.fractions),
        }
    }
}

pub type Properties = IndexMap<String, PropertyValue>;

// ------------------------------------------------------------------------------------------------
// Public file model
// ------------------------------------------------------------------------------------------------

/// A channel with its samples converted to `f64` (scaled, for DAQmx raw data).
#[derive(Debug, Clone, PartialEq)]
pub struct TdmsChannel {
    group: String,
    name: String,
    properties: Properties,
    data: Vec<f64>,
}

impl TdmsChannel {
    pub fn group(&self) -> &str {
        &self.group
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }
    pub fn data(&self) -> &[f64] {
        &self.data
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Per-sample time vector `wf_start_offset + i * wf_increment`.
    /// `None` when the channel carries no `wf_increment` property.
    pub fn time_track(&self) -> Option<Vec<f64>> {
        let increment = self.property("wf_increment")?.as_f64()?;
        let offset = self
            .property("wf_start_offset")
            .and_then(PropertyValue::as_f64)
            .unwrap_or(0.);
        Some(
            (0..self.data.len())
                .map(|i| offset + i as f64 * increment)
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TdmsGroup {
    name: String,
    properties: Properties,
    channels: IndexMap<String, TdmsChannel>,
}

impl TdmsGroup {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
    pub fn channels(&self) -> impl Iterator<Item = &TdmsChannel> {
        self.channels.values()
    }
    pub fn channel(&self, name: &str) -> Option<&TdmsChannel> {
        self.channels.get(name)
    }
}

/// A fully parsed TDMS file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TdmsFile {
    properties: Properties,
    groups: IndexMap<String, TdmsGroup>,
}

impl TdmsFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut parser = SegmentParser::default();
        let mut offset = 0;
        while offset < bytes.len() {
            offset = parser.read_segment(bytes, offset)?;
        }
        parser.finish()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
    pub fn groups(&self) -> impl Iterator<Item = &TdmsGroup> {
        self.groups.values()
    }
    pub fn group(&self, name: &str) -> Option<&TdmsGroup> {
        self.groups.get(name)
    }
    pub fn channel(&self, group: &str, channel: &str) -> Option<&TdmsChannel> {
        self.group(group)?.channel(channel)
    }
}

// ------------------------------------------------------------------------------------------------
// Object paths
// ------------------------------------------------------------------------------------------------

/// Encodes path components as `/'a'/'b'`, doubling embedded single quotes.
pub fn object_path(components: &[&str]) -> String {
    if components.is_empty() {
        return "/".to_string();
    }
    components
        .iter()
        .map(|c| format!("/'{}'", c.replace('\'', "''")))
        .collect()
}

fn parse_object_path(path: &str) -> Result<Vec<String>> {
    if path == "/" {
        return Ok(Vec::new());
    }
    let bad = || TdmsError::BadPath(path.to_string());
    let mut components = Vec::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '/' || chars.next() != Some('\'') {
            return Err(bad());
        }
        let mut component = String::new();
        loop {
            match chars.next() {
                Some('\'') if chars.peek() == Some(&'\'') => {
                    chars.next();
                    component.push('\'');
                }
                Some('\'') => break,
                Some(ch) => component.push(ch),
                None => return Err(bad()),
            }
        }
        components.push(component);
    }
    if components.len() > 2 {
        return Err(bad());
    }
    Ok(components)
}

// ------------------------------------------------------------------------------------------------
// Byte cursor
// ------------------------------------------------------------------------------------------------

struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
}

macro_rules! read_num {
    ($fn_name: ident, $ty: ty) => {
        fn $fn_name(&mut self) -> Result<$ty> {
            let bytes = self.array()?;
            Ok(if self.big_endian {
                <$ty>::from_be_bytes(bytes)
            } else {
                <$ty>::from_le_bytes(bytes)
            })
        }
    };
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8], pos: usize, big_endian: bool) -> Self {
        Self {
            buf,
            pos,
            big_endian,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(TdmsError::Truncated {
                offset: self.pos,
                needed: self.pos.saturating_add(n).saturating_sub(self.buf.len()),
            }),
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Reads a `u32` element count whose records, at least `record_len` bytes each, must fit
    /// in the bytes left.
    fn read_count(&mut self, record_len: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        let needed = count.saturating_mul(record_len);
        if needed > self.remaining() {
            return Err(TdmsError::Truncated {
                offset: self.pos,
                needed: needed - self.remaining(),
            });
        }
        Ok(count)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    read_num!(read_u8, u8);
    read_num!(read_i8, i8);
    read_num!(read_u16, u16);
    read_num!(read_i16, i16);
    read_num!(read_u32, u32);
    read_num!(read_i32, i32);
    read_num!(read_u64, u64);
    read_num!(read_i64, i64);
    read_num!(read_f32, f32);
    read_num!(read_f64, f64);

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn read_timestamp(&mut self) -> Result<TdmsTimestamp> {
        let (seconds, fractions) = if self.big_endian {
            let seconds = self.read_i64()?;
            (seconds, self.read_u64()?)
        } else {
            let fractions = self.read_u64()?;
            (self.read_i64()?, fractions)
        };
        Ok(TdmsTimestamp { seconds, fractions })
    }

    fn read_property(&mut self, data_type: DataType) -> Result<PropertyValue> {
        Ok(match data_type {
            DataType::I8 => PropertyValue::Int(self.read_i8()? as i64),
            DataType::I16 => PropertyValue::Int(self.read_i16()? as i64),
            DataType::I32 => PropertyValue::Int(self.read_i32()? as i64),
            DataType::I64 => PropertyValue::Int(self.read_i64()?),
            DataType::U8 => PropertyValue::UInt(self.read_u8()? as u64),
            DataType::U16 => PropertyValue::UInt(self.read_u16()? as u64),
            DataType::U32 => PropertyValue::UInt(self.read_u32()? as u64),
            DataType::U64 => PropertyValue::UInt(self.read_u64()?),
            DataType::F32 => PropertyValue::Float(self.read_f32()? as f64),
            DataType::F64 => PropertyValue::Float(self.read_f64()?),
            DataType::String => PropertyValue::String(self.read_string()?),
            DataType::Bool => PropertyValue::Bool(self.read_u8()? != 0),
            DataType::Timestamp => PropertyValue::Timestamp(self.read_timestamp()?),
        })
    }

    fn read_sample(&mut self, data_type: DataType) -> Result<f64> {
        Ok(match data_type {
            DataType::I8 => self.read_i8()? as f64,
            DataType::I16 => self.read_i16()? as f64,
            DataType::I32 => self.read_i32()? as f64,
            DataType::I64 => self.read_i64()? as f64,
            DataType::U8 => self.read_u8()? as f64,
            DataType::U16 => self.read_u16()? as f64,
            DataType::U32 => self.read_u32()? as f64,
            DataType::U64 => self.read_u64()? as f64,
            DataType::F32 => self.read_f32()? as f64,
            DataType::F64 => self.read_f64()?,
            DataType::Bool => (self.read_u8()? != 0) as u8 as f64,
            DataType::Timestamp => self.read_timestamp()?.as_secs_f64(),
            DataType::String => {
                return Err(TdmsError::Unsupported(
                    "String channels cannot be read as numeric samples".to_string(),
                ))
            }
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Segment parsing
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct DaqMxScaler {
    data_type: DataType,
    buffer_index: usize,
    byte_offset: usize,
    /// Bit within the addressed byte, digital line scalers only
    bit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
enum RawIndex {
    Standard {
        data_type: DataType,
        n_values: u64,
    },
    DaqMx {
        n_values: u64,
        scalers: Vec<DaqMxScaler>,
        widths: Vec<usize>,
    },
}

impl RawIndex {
    fn n_values(&self) -> u64 {
        match self {
            RawIndex::Standard { n_values, .. } | RawIndex::DaqMx { n_values, .. } => *n_values,
        }
    }
}

#[derive(Debug, Default)]
struct ObjectState {
    properties: Properties,
    last_index: Option<RawIndex>,
    raw: Vec<f64>,
}

#[derive(Default)]
struct SegmentParser {
    objects: IndexMap<String, ObjectState>,
    /// Objects carrying raw data in the previous segment, in storage order
    active: Vec<(String, RawIndex)>,
}

impl SegmentParser {
    /// Parses the segment at `start`, returns the offset of the next one.
    fn read_segment(&mut self, bytes: &[u8], start: usize) -> Result<usize> {
        let mut lead_in = ByteCursor::new(bytes, start, false);
        if lead_in.take(4)? != TDMS_TAG {
            return Err(TdmsError::BadTag { offset: start });
        }
        let toc = lead_in.read_u32()?;
        let version = lead_in.read_u32()?;
        if version != TDMS_VERSION && version != TDMS_VERSION_LEGACY {
            return Err(TdmsError::UnsupportedVersion(version));
        }
        let next_segment_offset = lead_in.read_u64()?;
        let raw_data_offset = lead_in.read_u64()?;

        let body_start = start + LEAD_IN_LEN;
        // An unfinished write leaves the segment length unset: the segment extends to end of file
        let segment_end = if next_segment_offset == u64::MAX {
            bytes.len()
        } else {
            end_within(body_start, next_segment_offset, bytes.len())?
        };
        let big_endian = toc & TOC_BIG_ENDIAN != 0;

        if toc & TOC_META_DATA != 0 {
            let mut meta = ByteCursor::new(&bytes[..segment_end], body_start, big_endian);
            self.read_metadata(&mut meta, toc & TOC_NEW_OBJ_LIST != 0)?;
        }

        if toc & (TOC_RAW_DATA | TOC_DAQMX_RAW_DATA) != 0 {
            let data_start = end_within(body_start, raw_data_offset, segment_end)?;
            let raw = &bytes[data_start..segment_end];
            self.read_raw_data(raw, data_start, big_endian, toc & TOC_INTERLEAVED_DATA != 0)?;
        }
        Ok(segment_end)
    }

    fn read_metadata(&mut self, cur: &mut ByteCursor, new_obj_list: bool) -> Result<()> {
        if new_obj_list {
            self.active.clear();
        }
        let n_objects = cur.read_u32()?;
        for _ in 0..n_objects {
            let path = cur.read_string()?;
            let index_header = cur.read_u32()?;
            let index = match index_header {
                RAW_INDEX_NO_DATA => None,
                RAW_INDEX_MATCHES_PREVIOUS => Some(
                    self.objects
                        .get(&path)
                        .and_then(|obj| obj.last_index.clone())
                        .ok_or_else(|| TdmsError::MissingPreviousIndex { path: path.clone() })?,
                ),
                RAW_INDEX_FORMAT_CHANGING_SCALER => Some(read_daqmx_index(cur, false)?),
                RAW_INDEX_DIGITAL_LINE_SCALER => Some(read_daqmx_index(cur, true)?),
                _ => Some(read_standard_index(cur)?),
            };

            let n_props = cur.read_u32()?;
            let mut props = Properties::new();
            for _ in 0..n_props {
                let name = cur.read_string()?;
                let data_type = DataType::from_code(cur.read_u32()?)?;
                props.insert(name, cur.read_property(data_type)?);
            }

            let obj = self.objects.entry(path.clone()).or_default();
            obj.properties.extend(props);

            let position = self.active.iter().position(|(p, _)| *p == path);
            match (index, position) {
                (Some(index), Some(pos)) => {
                    obj.last_index = Some(index.clone());
                    self.active[pos].1 = index;
                }
                (Some(index), None) => {
                    obj.last_index = Some(index.clone());
                    self.active.push((path, index));
                }
                (None, Some(pos)) => {
                    self.active.remove(pos);
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    /// Reads the raw data block found at byte `offset` of the file.
    fn read_raw_data(
        &mut self,
        raw: &[u8],
        offset: usize,
        big_endian: bool,
        interleaved: bool,
    ) -> Result<()> {
        if self.active.is_empty() || raw.is_empty() {
            return Ok(());
        }
        let is_daqmx = |idx: &RawIndex| matches!(idx, RawIndex::DaqMx { .. });
        let n_daqmx = self.active.iter().filter(|(_, idx)| is_daqmx(idx)).count();
        if n_daqmx > 0 && n_daqmx != self.active.len() {
            return Err(TdmsError::Unsupported(
                "Segments mixing DAQmx and standard raw data are not supported".to_string(),
            ));
        }

        let chunk_size = if n_daqmx > 0 {
            let size = daqmx_chunk_size(&self.active[0].1);
            if self.active.iter().any(|(_, idx)| daqmx_chunk_size(idx) != size) {
                return Err(TdmsError::Unsupported(
                    "DAQmx objects of one segment declare different raw buffer layouts".to_string(),
                ));
            }
            size
        } else {
            self.standard_chunk_size()?
        };
        if chunk_size == 0 {
            return Ok(());
        }
        if chunk_size > raw.len() {
            return Err(TdmsError::Truncated {
                offset,
                needed: chunk_size - raw.len(),
            });
        }
        let n_chunks = raw.len() / chunk_size;
        if raw.len() % chunk_size != 0 {
            log::warn!(
                "Raw data block of {} bytes is not a multiple of the {} byte chunk size, ignoring the remainder",
                raw.len(),
                chunk_size
            );
        }

        for chunk in 0..n_chunks {
            let chunk_bytes = &raw[chunk * chunk_size..(chunk + 1) * chunk_size];
            if n_daqmx > 0 {
                self.read_daqmx_chunk(chunk_bytes, big_endian)?;
            } else if interleaved {
                self.read_interleaved_chunk(chunk_bytes, big_endian)?;
            } else {
                self.read_contiguous_chunk(chunk_bytes, big_endian)?;
            }
        }
        Ok(())
    }

    fn standard_chunk_size(&self) -> Result<usize> {
        let mut size = 0;
        for (path, index) in &self.active {
            if let RawIndex::Standard {
                data_type,
                n_values,
            } = index
            {
                let elem = data_type.size().ok_or_else(|| {
                    TdmsError::Unsupported(format!("Raw string data in {} is not supported", path))
                })?;
                size = usize::try_from(*n_values)
                    .unwrap_or(usize::MAX)
                    .saturating_mul(elem)
                    .saturating_add(size);
            }
        }
        Ok(size)
    }

    fn read_contiguous_chunk(&mut self, chunk: &[u8], big_endian: bool) -> Result<()> {
        let mut cur = ByteCursor::new(chunk, 0, big_endian);
        for (path, index) in &self.active {
            if let RawIndex::Standard {
                data_type,
                n_values,
            } = index
            {
                let obj = self.objects.entry(path.clone()).or_default();
                obj.raw.reserve(*n_values as usize);
                for _ in 0..*n_values {
                    obj.raw.push(cur.read_sample(*data_type)?);
                }
            }
        }
        Ok(())
    }

    fn read_interleaved_chunk(&mut self, chunk: &[u8], big_endian: bool) -> Result<()> {
        let n_values = self.active[0].1.n_values();
        if self.active.iter().any(|(_, idx)| idx.n_values() != n_values) {
            return Err(TdmsError::Unsupported(
                "Interleaved data requires equal value counts for all channels".to_string(),
            ));
        }
        let mut cur = ByteCursor::new(chunk, 0, big_endian);
        for _ in 0..n_values {
            for (path, index) in &self.active {
                if let RawIndex::Standard { data_type, .. } = index {
                    let sample = cur.read_sample(*data_type)?;
                    self.objects.entry(path.clone()).or_default().raw.push(sample);
                }
            }
        }
        Ok(())
    }

    fn read_daqmx_chunk(&mut self, chunk: &[u8], big_endian: bool) -> Result<()> {
        for (path, index) in &self.active {
            let RawIndex::DaqMx {
                n_values,
                scalers,
                widths,
            } = index
            else {
                continue;
            };
            let scaler = scalers.first().ok_or_else(|| {
                TdmsError::Unsupported(format!("DAQmx object {} declares no scaler", path))
            })?;
            let width = *widths.get(scaler.buffer_index).ok_or_else(|| {
                TdmsError::Unsupported(format!(
                    "DAQmx object {} references missing raw buffer {}",
                    path, scaler.buffer_index
                ))
            })?;
            // Bounded by the chunk size, already checked against the raw block
            let n_values = *n_values as usize;
            let buffer_start: usize = widths[..scaler.buffer_index]
                .iter()
                .map(|w| w * n_values)
                .sum();

            let obj = self.objects.entry(path.clone()).or_default();
            obj.raw.reserve(n_values);
            for i in 0..n_values {
                let pos = buffer_start + i * width + scaler.byte_offset;
                let mut cur = ByteCursor::new(chunk, pos, big_endian);
                let sample = match scaler.bit {
                    Some(bit) => ((cur.read_u8()? >> (bit % 8)) & 1) as f64,
                    None => cur.read_sample(scaler.data_type)?,
                };
                obj.raw.push(sample);
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<TdmsFile> {
        let mut file = TdmsFile::default();
        for (path, obj) in self.objects {
            let components = parse_object_path(&path)?;
            match components.as_slice() {
                [] => file.properties.extend(obj.properties),
                [group] => {
                    let entry = file
                        .groups
                        .entry(group.clone())
                        .or_insert_with(|| TdmsGroup {
                            name: group.clone(),
                            ..Default::default()
                        });
                    entry.properties.extend(obj.properties);
                }
                [group, channel] => {
                    let data = scale_channel(&obj.properties, obj.raw)?;
                    let entry = file
                        .groups
                        .entry(group.clone())
                        .or_insert_with(|| TdmsGroup {
                            name: group.clone(),
                            ..Default::default()
                        });
                    entry.channels.insert(
                        channel.clone(),
                        TdmsChannel {
                            group: group.clone(),
                            name: channel.clone(),
                            properties: obj.properties,
                            data,
                        },
                    );
                }
                _ => return Err(TdmsError::BadPath(path)),
            }
        }
        Ok(file)
    }
}

fn read_standard_index(cur: &mut ByteCursor) -> Result<RawIndex> {
    let data_type = DataType::from_code(cur.read_u32()?)?;
    let dimension = cur.read_u32()?;
    if dimension != 1 {
        return Err(TdmsError::Unsupported(format!(
            "Raw data dimension {} (only 1 is defined)",
            dimension
        )));
    }
    let n_values = cur.read_u64()?;
    if data_type == DataType::String {
        // total size in bytes of the string data
        cur.read_u64()?;
    }
    Ok(RawIndex::Standard {
        data_type,
        n_values,
    })
}

fn read_daqmx_index(cur: &mut ByteCursor, digital_line: bool) -> Result<RawIndex> {
    let data_type = cur.read_u32()?;
    if data_type != DAQMX_RAW_DATA_TYPE {
        return Err(TdmsError::UnsupportedDataType(data_type));
    }
    let _dimension = cur.read_u32()?;
    let n_values = cur.read_u64()?;

    let scaler_len = if digital_line {
        DIGITAL_LINE_SCALER_LEN
    } else {
        FORMAT_CHANGING_SCALER_LEN
    };
    let n_scalers = cur.read_count(scaler_len)?;
    let mut scalers = Vec::with_capacity(n_scalers);
    for _ in 0..n_scalers {
        let data_type = DataType::from_daqmx_code(cur.read_u32()?)?;
        let buffer_index = cur.read_u32()? as usize;
        let offset = cur.read_u32()?;
        let scaler = if digital_line {
            let _sample_format_bitmap = cur.read_u8()?;
            DaqMxScaler {
                data_type,
                buffer_index,
                byte_offset: (offset / 8) as usize,
                bit: Some(offset % 8),
            }
        } else {
            let _sample_format_bitmap = cur.read_u32()?;
            DaqMxScaler {
                data_type,
                buffer_index,
                byte_offset: offset as usize,
                bit: None,
            }
        };
        let _scale_id = cur.read_u32()?;
        scalers.push(scaler);
    }

    let n_widths = cur.read_count(4)?;
    let mut widths = Vec::with_capacity(n_widths);
    for _ in 0..n_widths {
        widths.push(cur.read_u32()? as usize);
    }
    Ok(RawIndex::DaqMx {
        n_values,
        scalers,
        widths,
    })
}

/// Saturates instead of overflowing, so oversized declarations fail the raw block length check.
fn daqmx_chunk_size(index: &RawIndex) -> usize {
    match index {
        RawIndex::DaqMx {
            n_values, widths, ..
        } => {
            let n_values = usize::try_from(*n_values).unwrap_or(usize::MAX);
            widths
                .iter()
                .fold(0usize, |size, w| size.saturating_add(w.saturating_mul(n_values)))
        }
        RawIndex::Standard { .. } => 0,
    }
}

/// `start + len`, provided it stays within `limit`.
fn end_within(start: usize, len: u64, limit: usize) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .filter(|end| *end <= limit)
        .ok_or(TdmsError::Truncated {
            offset: start,
            needed: (start as u64)
                .saturating_add(len)
                .saturating_sub(limit as u64)
                .try_into()
                .unwrap_or(usize::MAX),
        })
}

// ------------------------------------------------------------------------------------------------
// Scaling
// ------------------------------------------------------------------------------------------------

/// Applies the `NI_Scale[n]` chain stored by the DAQmx logger to raw samples.
/// Channels without scaling information, or already marked scaled, are returned unchanged.
fn scale_channel(props: &Properties, raw: Vec<f64>) -> Result<Vec<f64>> {
    let n_scales = match props.get("NI_Number_Of_Scales").and_then(PropertyValue::as_u64) {
        Some(n) if n > 0 => n,
        _ => return Ok(raw),
    };
    if let Some(status) = props.get("NI_Scaling_Status").and_then(PropertyValue::as_str) {
        if status != "unscaled" {
            return Ok(raw);
        }
    }
    apply_scale(props, n_scales - 1, &raw)
}

fn apply_scale(props: &Properties, index: u64, raw: &[f64]) -> Result<Vec<f64>> {
    let scale_type = props
        .get(&format!("NI_Scale[{}]_Scale_Type", index))
        .and_then(PropertyValue::as_str)
        .ok_or_else(|| TdmsError::Unsupported(format!("NI_Scale[{}] has no scale type", index)))?;
    let prop_f64 = |key: String| {
        props
            .get(&key)
            .and_then(PropertyValue::as_f64)
            .ok_or_else(|| TdmsError::Unsupported(format!("Missing scaling property {}", key)))
    };
    let input = |source_key: String| -> Result<Vec<f64>> {
        let source = props
            .get(&source_key)
            .and_then(PropertyValue::as_u64)
            .unwrap_or(SCALE_RAW_INPUT);
        // Sources always precede the scale using them
        if source < index {
            apply_scale(props, source, raw)
        } else {
            Ok(raw.to_vec())
        }
    };

    match scale_type {
        "Linear" => {
            let prefix = format!("NI_Scale[{}]_Linear", index);
            let slope = prop_f64(format!("{}_Slope", prefix))?;
            let intercept = prop_f64(format!("{}_Y_Intercept", prefix))?;
            let x = input(format!("{}_Input_Source", prefix))?;
            Ok(x.iter().map(|v| v * slope + intercept).collect())
        }
        "Polynomial" => {
            let prefix = format!("NI_Scale[{}]_Polynomial", index);
            let n_coeffs = props
                .get(&format!("{}_Coefficients_Size", prefix))
                .and_then(PropertyValue::as_u64)
                .unwrap_or(0);
            let coeffs = (0..n_coeffs)
                .map(|i| prop_f64(format!("{}_Coefficients[{}]", prefix, i)))
                .collect::<Result<Vec<f64>>>()?;
            let x = input(format!("{}_Input_Source", prefix))?;
            Ok(x.iter()
                .map(|v| coeffs.iter().rev().fold(0., |acc, c| acc * v + c))
                .collect())
        }
        other => Err(TdmsError::Unsupported(format!(
            "Scale type {} of NI_Scale[{}] is not supported",
            other, index
        ))),
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

struct WriterChannel {
    properties: Properties,
    data: Vec<f64>,
}

#[derive(Default)]
struct WriterGroup {
    properties: Properties,
    channels: IndexMap<String, WriterChannel>,
}

/// Builds a single-segment TDMS file holding `f64` channels.
#[derive(Default)]
pub struct TdmsWriter {
    properties: Properties,
    groups: IndexMap<String, WriterGroup>,
}

impl TdmsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_file_property(&mut self, name: &str, value: PropertyValue) {
        self.properties.insert(name.to_string(), value);
    }

    pub fn set_group_property(&mut self, group: &str, name: &str, value: PropertyValue) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .properties
            .insert(name.to_string(), value);
    }

    /// Adds (or replaces) a channel. Channels are stored in insertion order.
    pub fn add_channel(&mut self, group: &str, channel: &str, data: Vec<f64>, properties: Properties) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .channels
            .insert(channel.to_string(), WriterChannel { properties, data });
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut meta = Vec::new();
        let n_objects = 1 + self
            .groups
            .values()
            .map(|g| 1 + g.channels.len())
            .sum::<usize>();
        put_u32(&mut meta, n_objects as u32);
        write_object(&mut meta, "/", None, &self.properties);
        for (group_name, group) in &self.groups {
            write_object(&mut meta, &object_path(&[group_name]), None, &group.properties);
            for (chan_name, chan) in &group.channels {
                let n_values = (!chan.data.is_empty()).then_some(chan.data.len() as u64);
                write_object(
                    &mut meta,
                    &object_path(&[group_name, chan_name]),
                    n_values,
                    &chan.properties,
                );
            }
        }

        let mut raw = Vec::new();
        for chan in self.groups.values().flat_map(|g| g.channels.values()) {
            for v in &chan.data {
                raw.extend_from_slice(&v.to_le_bytes());
            }
        }

        let mut toc = TOC_META_DATA | TOC_NEW_OBJ_LIST;
        if !raw.is_empty() {
            toc |= TOC_RAW_DATA;
        }
        let mut out = Vec::with_capacity(LEAD_IN_LEN + meta.len() + raw.len());
        out.extend_from_slice(TDMS_TAG);
        put_u32(&mut out, toc);
        put_u32(&mut out, TDMS_VERSION);
        out.extend_from_slice(&((meta.len() + raw.len()) as u64).to_le_bytes());
        out.extend_from_slice(&(meta.len() as u64).to_le_bytes());
        out.extend_from_slice(&meta);
        out.extend_from_slice(&raw);
        out
    }

    /// Writes the file, replacing any existing one at `path`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), self.to_bytes())?;
        Ok(())
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn write_object(buf: &mut Vec<u8>, path: &str, n_values: Option<u64>, props: &Properties) {
    put_string(buf, path);
    match n_values {
        Some(n) => {
            put_u32(buf, 20);
            put_u32(buf, DataType::F64.code());
            put_u32(buf, 1);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        None => put_u32(buf, RAW_INDEX_NO_DATA),
    }
    put_u32(buf, props.len() as u32);
    for (name, value) in props {
        put_string(buf, name);
        match value {
            PropertyValue::Int(v) => {
                put_u32(buf, DataType::I64.code());
                buf.extend_from_slice(&v.to_le_bytes());
            }
            PropertyValue::UInt(v) => {
                put_u32(buf, DataType::U64.code());
                buf.extend_from_slice(&v.to_le_bytes());
            }
            PropertyValue::Float(v) => {
                put_u32(buf, DataType::F64.code());
                buf.extend_from_slice(&v.to_le_bytes());
            }
            PropertyValue::String(v) => {
                put_u32(buf, DataType::String.code());
                put_string(buf, v);
            }
            PropertyValue::Bool(v) => {
                put_u32(buf, DataType::Bool.code());
                buf.push(*v as u8);
            }
            PropertyValue::Timestamp(ts) => {
                put_u32(buf, DataType::Timestamp.code());
                buf.extend_from_slice(&ts.fractions.to_le_bytes());
                buf.extend_from_slice(&ts.seconds.to_le_bytes());
            }
        }
    }
}
