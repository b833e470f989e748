use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Defines the interface for reading and writing volumes in the generic array format.
///
/// Implementors handle the encoding; the provided methods add buffered file access on top.
pub trait ArrayFile: Sized {
    /// The error type for I/O operations.
    type Error: Error + From<io::Error>;

    /// Decodes one array from a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `Self`.
    fn read_from(reader: &mut impl Read) -> Result<Self, Self::Error>;

    /// Encodes the array to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_to(&self, writer: &mut impl Write) -> Result<(), Self::Error>;

    fn read_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Self::Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
    }

    fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), Self::Error> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
