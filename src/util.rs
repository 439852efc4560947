use crate::Result;
use qu::ick_use::*;
use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn check_extension(path: &Path, ext: &str) -> Result {
    ensure!(
        matches!(path.extension(), Some(p) if p == ext),
        "filename should end with `.{}`",
        ext
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{check_extension, path_exists};
    use std::path::Path;

    #[test]
    fn extensions() {
        assert!(check_extension(Path::new("out/dataset.csv"), "csv").is_ok());
        assert!(check_extension(Path::new("out/dataset.csv.gz"), "csv").is_err());
        assert!(check_extension(Path::new("out/dataset"), "csv").is_err());
    }

    #[test]
    fn missing_path() {
        assert!(!path_exists(Path::new("/this/path/does/not/exist")).unwrap());
        assert!(path_exists(Path::new(env!("CARGO_MANIFEST_DIR"))).unwrap());
    }
}
