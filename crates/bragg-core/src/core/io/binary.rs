use super::traits::ArrayFile;
use ndarray::{Array, Array3, Dimension};
use serde::{Serialize, de::DeserializeOwned};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArrayIoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to decode array: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Failed to parse TOML file '{path}': {source}", path = path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize TOML: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("Dataset '{path}' contains negative or non-finite values", path = path.display())]
    InvalidData { path: PathBuf },
}

impl<A, D> ArrayFile for Array<A, D>
where
    A: Serialize + DeserializeOwned,
    D: Dimension + Serialize + DeserializeOwned,
{
    type Error = ArrayIoError;

    fn read_from(reader: &mut impl Read) -> Result<Self, Self::Error> {
        Ok(bincode::deserialize_from(reader)?)
    }

    fn write_to(&self, writer: &mut impl Write) -> Result<(), Self::Error> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }
}

/// Reads a measured diffraction magnitude, rejecting negative or non-finite voxels.
pub fn load_dataset(path: &Path) -> Result<Array3<f64>, ArrayIoError> {
    let data = Array3::<f64>::read_from_path(path)?;
    if data.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(ArrayIoError::InvalidData {
            path: path.to_path_buf(),
        });
    }
    Ok(data)
}

pub fn write_errors_text(path: &Path, errors: &[f64]) -> Result<(), ArrayIoError> {
    let mut file = io::BufWriter::new(fs::File::create(path)?);
    for error in errors {
        writeln!(file, "{error}")?;
    }
    file.flush()?;
    Ok(())
}

pub fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), ArrayIoError> {
    let content = toml::to_string_pretty(value)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ArrayIoError> {
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|source| ArrayIoError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use num_complex::Complex64;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[test]
    fn complex_volume_survives_a_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let image = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| {
            Complex64::new(i as f64, (j * k) as f64 - 0.5)
        });
        image.write_to_path(&path).unwrap();
        let loaded = Array3::<Complex64>::read_from_path(&path).unwrap();
        assert_eq!(loaded, image);
    }

    #[test]
    fn reading_a_volume_with_the_wrong_rank_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("errors.bin");
        Array1::from(vec![0.5, 0.25]).write_to_path(&path).unwrap();
        assert!(Array3::<f64>::read_from_path(&path).is_err());
    }

    #[test]
    fn load_dataset_rejects_negative_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut data = Array3::<f64>::ones((2, 2, 2));
        data[[1, 1, 1]] = -1.0;
        data.write_to_path(&path).unwrap();
        assert!(matches!(
            load_dataset(&path),
            Err(ArrayIoError::InvalidData { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let result = load_dataset(&dir.path().join("absent.bin"));
        assert!(matches!(result, Err(ArrayIoError::Io(_))));
    }

    #[test]
    fn errors_text_has_one_value_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("errors.txt");
        write_errors_text(&path, &[0.5, 0.25]).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec!["0.5", "0.25"]);
    }

    #[test]
    fn toml_helpers_round_trip_a_struct() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Summary {
            chi: f64,
            area: f64,
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.toml");
        let summary = Summary {
            chi: 0.125,
            area: 42.0,
        };
        write_toml(&path, &summary).unwrap();
        assert_eq!(read_toml::<Summary>(&path).unwrap(), summary);
    }
}
