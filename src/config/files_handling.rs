use crate::error::{Error, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;


pub fn read_input<R: ReadFile>(file_path: &Path) -> Result<R> {
    R::read_file(file_path)
}

pub fn save_output<S: SaveFile + ?Sized>(file_path: &Path, item: &S) -> Result<()> {

    // create output folder
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    item.save_file(file_path)
}

/// Opens a text corpus for line reading, transparently decompressing `.gz` files.
pub fn open_text(file_path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let f = File::open(file_path)?;
    if file_path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(f))))
    } else {
        Ok(Box::new(BufReader::new(f)))
    }
}

pub fn write_gz_bytes(file_path: &Path, buf: &[u8]) -> Result<()> {
    let f = BufWriter::new(File::create(file_path)?);
    let mut writer = GzEncoder::new(f, Compression::default());
    writer.write_all(buf)?;
    let mut inner = writer.finish()?;
    inner.flush()?;
    Ok(())
}

pub fn read_gz_bytes(file_path: &Path) -> Result<Vec<u8>> {
    let f = BufReader::new(File::open(file_path)?);
    let mut reader = MultiGzDecoder::new(f);
    let mut buf: Vec<u8> = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

pub trait ReadFile: Sized {
    fn read_file(file_path: &Path) -> Result<Self>;
}

pub trait SaveFile {
    fn save_file(&self, file_path: &Path) -> Result<()>;
}

impl ReadFile for Array2<f64> {
    fn read_file(file_path: &Path) -> Result<Self> {
        Ok(read_npy(file_path)?)
    }
}

impl ReadFile for Array2<f32> {
    fn read_file(file_path: &Path) -> Result<Self> {
        Ok(read_npy(file_path)?)
    }
}

impl SaveFile for Array2<f64> {
    fn save_file(&self, file_path: &Path) -> Result<()> {
        write_npy(file_path, self)?;
        Ok(())
    }
}

impl SaveFile for Array2<f32> {
    fn save_file(&self, file_path: &Path) -> Result<()> {
        write_npy(file_path, self)?;
        Ok(())
    }
}

// newline delimited, no trailing newline; line index is the word id
impl ReadFile for Vec<String> {
    fn read_file(file_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(file_path)?;
        if content.is_empty() {
            return Ok(Vec::new());
        }
        Ok(content.split('\n').map(|line| line.trim_end_matches('\r').to_string()).collect())
    }
}

impl SaveFile for [String] {
    fn save_file(&self, file_path: &Path) -> Result<()> {
        let mut f = BufWriter::new(File::create(file_path)?);
        f.write_all(self.join("\n").as_bytes())?;
        f.flush()?;
        Ok(())
    }
}

impl ReadFile for Vec<u64> {
    fn read_file(file_path: &Path) -> Result<Self> {
        let lines = Vec::<String>::read_file(file_path)?;
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                line.trim().parse::<u64>().map_err(|_| {
                    Error::config(format!("{}:{}: `{}` is not a count", file_path.display(), i + 1, line))
                })
            })
            .collect()
    }
}

impl SaveFile for [u64] {
    fn save_file(&self, file_path: &Path) -> Result<()> {
        let mut f = BufWriter::new(File::create(file_path)?);
        for (i, count) in self.iter().enumerate() {
            if i > 0 {
                f.write_all(b"\n")?;
            }
            write!(f, "{}", count)?;
        }
        f.flush()?;
        Ok(())
    }
}
