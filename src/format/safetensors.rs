//! SafeTensors file reader and writer
//!
//! # Format
//!
//! ```text
//! [8 bytes] header_size (little-endian u64)
//! [header_size bytes] JSON header containing:
//!   - "__metadata__": optional dict of string key-value pairs
//!   - "<tensor_name>": { "dtype": str, "shape": [int], "data_offsets": [start, end] }
//! [remaining bytes] raw little-endian tensor data
//! ```
//!
//! Tensors keep their stored dtype on load (F32, F16, BF16, F64, U8, I32,
//! I64). Checkpoints
//! hold dense weights only; packing happens after loading.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Information about a tensor in a SafeTensors file
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data_start: usize,
    pub data_end: usize,
}

impl TensorInfo {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.data_end - self.data_start
    }
}

/// SafeTensors file reader
pub struct SafeTensors {
    file: File,
    data_offset: u64,
    tensors: HashMap<String, TensorInfo>,
    metadata: HashMap<String, String>,
}

fn io_error(context: &str) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| Error::ModelError {
        reason: format!("IO error {context}: {e}"),
    }
}

impl SafeTensors {
    /// Open and parse a SafeTensors file header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path.as_ref()).map_err(io_error("opening file"))?;
        let file_size = file.metadata().map_err(io_error("reading metadata"))?.len();

        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)
            .map_err(io_error("reading header size"))?;
        let header_size = u64::from_le_bytes(buf);

        if header_size > file_size.saturating_sub(8) {
            return Err(Error::ModelError {
                reason: format!("header size {header_size} exceeds file size {file_size}"),
            });
        }

        let mut header_buf = vec![0u8; header_size as usize];
        file.read_exact(&mut header_buf)
            .map_err(io_error("reading header"))?;

        let header: Value = serde_json::from_slice(&header_buf).map_err(|e| Error::ModelError {
            reason: format!("JSON parse error: {e}"),
        })?;
        let header_obj = header.as_object().ok_or_else(|| Error::ModelError {
            reason: "header is not a JSON object".into(),
        })?;

        let mut tensors = HashMap::new();
        let mut metadata = HashMap::new();

        for (key, value) in header_obj {
            if key == "__metadata__" {
                if let Some(meta_obj) = value.as_object() {
                    for (mk, mv) in meta_obj {
                        if let Some(s) = mv.as_str() {
                            metadata.insert(mk.clone(), s.to_string());
                        }
                    }
                }
                continue;
            }
            let info = parse_tensor_entry(key, value)?;
            tensors.insert(key.clone(), info);
        }

        let data_offset = 8 + header_size;
        let data_len = file_size - data_offset;
        if let Some(info) = tensors.values().find(|t| t.data_end as u64 > data_len) {
            return Err(Error::ModelError {
                reason: format!(
                    "tensor '{}' ends at byte {} but the data section holds {data_len}",
                    info.name, info.data_end
                ),
            });
        }

        Ok(SafeTensors {
            file,
            data_offset,
            tensors,
            metadata,
        })
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn tensor_info(&self, name: &str) -> Result<&TensorInfo> {
        self.tensors.get(name).ok_or_else(|| Error::ModelError {
            reason: format!("tensor not found: {name}"),
        })
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Read raw tensor data as bytes
    pub fn read_tensor_bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        let info = self.tensor_info(name)?;
        let abs_start = self.data_offset + info.data_start as u64;
        let mut buf = vec![0u8; info.size_bytes()];

        self.file
            .seek(SeekFrom::Start(abs_start))
            .map_err(io_error("seeking"))?;
        self.file
            .read_exact(&mut buf)
            .map_err(io_error("reading tensor data"))?;

        Ok(buf)
    }

    /// Load a tensor in its stored dtype on the given device
    pub fn load_tensor<R: Runtime<DType = DType>>(
        &mut self,
        name: &str,
        device: &R::Device,
    ) -> Result<Tensor<R>> {
        let (dtype, shape) = {
            let info = self.tensor_info(name)?;
            (info.dtype, info.shape.clone())
        };
        let bytes = self.read_tensor_bytes(name)?;
        Ok(Tensor::<R>::from_bytes(&bytes, &shape, dtype, device)?)
    }

    /// Load all tensors to the given device
    pub fn load_all<R: Runtime<DType = DType>>(
        &mut self,
        device: &R::Device,
    ) -> Result<HashMap<String, Tensor<R>>> {
        let names: Vec<String> = self.tensors.keys().cloned().collect();
        let mut result = HashMap::with_capacity(names.len());
        for name in names {
            let tensor = self.load_tensor(&name, device)?;
            result.insert(name, tensor);
        }
        Ok(result)
    }
}

fn parse_dtype(s: &str) -> Result<DType> {
    match s {
        "F32" => Ok(DType::F32),
        "F16" => Ok(DType::F16),
        "BF16" => Ok(DType::BF16),
        "F64" => Ok(DType::F64),
        "U8" => Ok(DType::U8),
        "I32" => Ok(DType::I32),
        "I64" => Ok(DType::I64),
        _ => Err(Error::ModelError {
            reason: format!("unsupported SafeTensors dtype: {s}"),
        }),
    }
}

fn dtype_tag(dtype: DType) -> Result<&'static str> {
    match dtype {
        DType::F32 => Ok("F32"),
        DType::F16 => Ok("F16"),
        DType::BF16 => Ok("BF16"),
        DType::F64 => Ok("F64"),
        DType::U8 => Ok("U8"),
        DType::I32 => Ok("I32"),
        DType::I64 => Ok("I64"),
        other => Err(Error::ModelError {
            reason: format!("cannot store {other:?} in SafeTensors"),
        }),
    }
}

fn parse_tensor_entry(key: &str, value: &Value) -> Result<TensorInfo> {
    let model_err = |what: &str| Error::ModelError {
        reason: format!("tensor '{key}' {what}"),
    };
    let obj = value.as_object().ok_or_else(|| model_err("is not an object"))?;

    let dtype_str = obj
        .get("dtype")
        .and_then(Value::as_str)
        .ok_or_else(|| model_err("missing dtype"))?;
    let dtype = parse_dtype(dtype_str)?;

    let shape = obj
        .get("shape")
        .and_then(Value::as_array)
        .ok_or_else(|| model_err("missing shape"))?
        .iter()
        .map(|v| v.as_u64().map(|n| n as usize))
        .collect::<Option<Vec<usize>>>()
        .ok_or_else(|| model_err("has a non-integer shape entry"))?;

    let offsets = obj
        .get("data_offsets")
        .and_then(Value::as_array)
        .ok_or_else(|| model_err("missing data_offsets"))?;
    let [start, end] = offsets.as_slice() else {
        return Err(model_err("data_offsets must have 2 elements"));
    };
    let data_start = start
        .as_u64()
        .ok_or_else(|| model_err("invalid data_offsets[0]"))? as usize;
    let data_end = end
        .as_u64()
        .ok_or_else(|| model_err("invalid data_offsets[1]"))? as usize;

    let byte_len = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .and_then(|numel| numel.checked_mul(dtype.size_in_bytes()))
        .ok_or_else(|| model_err(&format!("shape {shape:?} overflows")))?;
    if data_end < data_start || data_end - data_start != byte_len {
        return Err(Error::ModelError {
            reason: format!(
                "tensor '{key}' data_offsets [{data_start}, {data_end}] do not hold {byte_len} bytes of {dtype:?}"
            ),
        });
    }

    Ok(TensorInfo {
        name: key.to_string(),
        dtype,
        shape,
        data_start,
        data_end,
    })
}

/// Save tensors to SafeTensors format, keeping each tensor's dtype.
///
/// Views are written as their logical contents.
pub fn save_safetensors<P: AsRef<Path>>(
    path: P,
    tensors: &HashMap<String, Tensor<CpuRuntime>>,
    metadata: Option<&HashMap<String, String>>,
) -> Result<()> {
    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();

    let mut header = Map::new();
    if let Some(meta) = metadata {
        let meta_obj: Map<String, Value> = meta
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        header.insert("__metadata__".into(), Value::Object(meta_obj));
    }

    let mut payloads = Vec::with_capacity(names.len());
    let mut current_offset: usize = 0;
    for name in &names {
        let tensor = &tensors[*name];
        let bytes = tensor.contiguous()?.to_bytes()?;
        let byte_len = bytes.len();
        let mut info = Map::new();
        info.insert("dtype".into(), Value::String(dtype_tag(tensor.dtype())?.into()));
        info.insert(
            "shape".into(),
            Value::Array(tensor.shape().iter().map(|&s| Value::from(s)).collect()),
        );
        info.insert(
            "data_offsets".into(),
            Value::Array(vec![
                Value::from(current_offset),
                Value::from(current_offset + byte_len),
            ]),
        );
        header.insert((*name).clone(), Value::Object(info));
        current_offset += byte_len;
        payloads.push(bytes);
    }

    let header_bytes = serde_json::to_vec(&Value::Object(header)).map_err(|e| Error::ModelError {
        reason: format!("JSON serialize error: {e}"),
    })?;

    let file = File::create(path).map_err(io_error("creating file"))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&(header_bytes.len() as u64).to_le_bytes())
        .map_err(io_error("writing header size"))?;
    writer
        .write_all(&header_bytes)
        .map_err(io_error("writing header"))?;
    for bytes in &payloads {
        writer
            .write_all(bytes)
            .map_err(io_error("writing tensor data"))?;
    }
    writer.flush().map_err(io_error("flushing"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::ops::TypeConversionOps;
    use tempfile::NamedTempFile;

    fn create_test_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();

        let header = serde_json::json!({
            "__metadata__": { "format": "pt" },
            "weight": {
                "dtype": "F32",
                "shape": [2, 3],
                "data_offsets": [0, 24]
            }
        });
        let header_str = header.to_string();
        let header_bytes = header_str.as_bytes();

        file.write_all(&(header_bytes.len() as u64).to_le_bytes())
            .unwrap();
        file.write_all(header_bytes).unwrap();

        for f in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
            file.write_all(&f.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_open_and_metadata() {
        let f = create_test_file();
        let st = SafeTensors::open(f.path()).unwrap();
        assert_eq!(st.len(), 1);
        assert_eq!(st.metadata().get("format"), Some(&"pt".to_string()));
    }

    #[test]
    fn test_tensor_info() {
        let f = create_test_file();
        let st = SafeTensors::open(f.path()).unwrap();
        let info = st.tensor_info("weight").unwrap();
        assert_eq!(info.dtype, DType::F32);
        assert_eq!(info.shape, vec![2, 3]);
        assert_eq!(info.numel(), 6);
        assert_eq!(info.size_bytes(), 24);
        assert!(st.tensor_info("nonexistent").is_err());
    }

    #[test]
    fn test_load_tensor_f32() {
        let (_, device) = cpu_setup();
        let f = create_test_file();
        let mut st = SafeTensors::open(f.path()).unwrap();
        let tensor = st.load_tensor::<CpuRuntime>("weight", &device).unwrap();
        assert_eq!(tensor.shape(), &[2, 3]);
        assert_eq!(tensor.to_vec::<f32>(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    fn write_header_only(header: &serde_json::Value, data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let header = header.to_string();
        file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
        file.write_all(header.as_bytes()).unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_bad_offsets_rejected() {
        let file = write_header_only(
            &serde_json::json!({
                "w": { "dtype": "F16", "shape": [4], "data_offsets": [0, 4] }
            }),
            &[0u8; 4],
        );
        assert!(matches!(
            SafeTensors::open(file.path()),
            Err(Error::ModelError { .. })
        ));
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        let file = write_header_only(
            &serde_json::json!({
                "w": { "dtype": "F32", "shape": [1u64 << 62, 8], "data_offsets": [0, 0] }
            }),
            &[],
        );
        assert!(matches!(
            SafeTensors::open(file.path()),
            Err(Error::ModelError { .. })
        ));
    }

    #[test]
    fn test_offsets_past_end_of_file_rejected() {
        // header is self-consistent but the file holds only 8 of 16 bytes
        let file = write_header_only(
            &serde_json::json!({
                "w": { "dtype": "F32", "shape": [4], "data_offsets": [0, 16] }
            }),
            &[0u8; 8],
        );
        assert!(matches!(
            SafeTensors::open(file.path()),
            Err(Error::ModelError { .. })
        ));
    }

    #[test]
    fn test_save_and_load_preserves_dtype() {
        let (client, device) = cpu_setup();
        let tmp = NamedTempFile::new().unwrap();

        let mut tensors = HashMap::new();
        tensors.insert(
            "w1".to_string(),
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device).unwrap(),
        );
        let w2 = Tensor::<CpuRuntime>::from_slice(&[0.5f32, -0.25], &[2], &device).unwrap();
        tensors.insert("w2".to_string(), client.cast(&w2, DType::F16).unwrap());
        let mut meta = HashMap::new();
        meta.insert("format".to_string(), "pt".to_string());
        save_safetensors(tmp.path(), &tensors, Some(&meta)).unwrap();

        let mut loaded = SafeTensors::open(tmp.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.metadata().get("format").map(String::as_str), Some("pt"));

        let w1 = loaded.load_tensor::<CpuRuntime>("w1", &device).unwrap();
        assert_eq!(w1.shape(), &[2, 2]);
        assert_eq!(w1.to_vec::<f32>(), vec![1.0, 2.0, 3.0, 4.0]);

        let w2 = loaded.load_tensor::<CpuRuntime>("w2", &device).unwrap();
        assert_eq!(w2.dtype(), DType::F16);
        let w2 = client.cast(&w2, DType::F32).unwrap();
        assert_eq!(w2.to_vec::<f32>(), vec![0.5, -0.25]);
    }

    #[test]
    fn test_save_view_writes_only_view() {
        let (_, device) = cpu_setup();
        let tmp = NamedTempFile::new().unwrap();
        let data: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let full = Tensor::<CpuRuntime>::from_slice(&data, &[3, 2], &device).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert("tail".to_string(), full.narrow(0, 1, 2).unwrap());
        save_safetensors(tmp.path(), &tensors, None).unwrap();

        let mut loaded = SafeTensors::open(tmp.path()).unwrap();
        assert_eq!(loaded.tensor_info("tail").unwrap().shape, vec![2, 2]);
        let tail = loaded.load_tensor::<CpuRuntime>("tail", &device).unwrap();
        assert_eq!(tail.to_vec::<f32>(), vec![2.0, 3.0, 4.0, 5.0]);
    }
}
