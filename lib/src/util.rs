use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Result as IoResult, Write},
    path::Path,
};

/// Types persisted to and restored from standalone files.
pub trait Saveable
where
    Self: Sized,
{
    fn load<I: Read>(reader: I) -> IoResult<Self>;
    fn save<O: Write>(&self, writer: O) -> IoResult<()>;

    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> IoResult<()> {
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        self.save(&mut writer)?;
        writer.flush()
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        let file = File::open(&path)?;
        Self::load(BufReader::new(file))
    }
}
