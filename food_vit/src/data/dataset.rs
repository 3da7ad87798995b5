//! Class-per-subdirectory image dataset.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// One labelled training image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// `root/<class>/<file>` tree. Labels index into [`ImageFolder::classes`].
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<Sample>,
}

impl ImageFolder {
    /// Classes are the subdirectories of `root`, sorted by name.
    pub fn open(root: &Path) -> Result<Self> {
        ensure_dir(root)?;
        let mut classes = Vec::new();
        for entry in std::fs::read_dir(root).map_err(|e| Error::io(root, e))? {
            let entry = entry.map_err(|e| Error::io(root, e))?;
            let file_type = entry.file_type().map_err(|e| Error::io(entry.path(), e))?;
            if file_type.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();
        if classes.is_empty() {
            return Err(Error::Dataset(format!(
                "no class directories under {}",
                root.display()
            )));
        }
        Self::open_with_classes(root, &classes)
    }

    /// Use an explicit class list; label `i` is `classes[i]`. Every class
    /// must have a directory under `root`.
    pub fn open_with_classes(root: &Path, classes: &[String]) -> Result<Self> {
        ensure_dir(root)?;
        let mut samples = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let dir = root.join(class);
            if !dir.is_dir() {
                return Err(Error::Dataset(format!(
                    "class '{class}' has no directory at {}",
                    dir.display()
                )));
            }
            let mut files = Vec::new();
            for entry in std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
                let entry = entry.map_err(|e| Error::io(&dir, e))?;
                let file_type = entry.file_type().map_err(|e| Error::io(entry.path(), e))?;
                let path = entry.path();
                if file_type.is_file() || (file_type.is_symlink() && path.is_file()) {
                    files.push(path);
                }
            }
            files.sort();
            debug!(class = %class, label, images = files.len(), "indexed class");
            samples.extend(files.into_iter().map(|path| Sample { path, label }));
        }
        if samples.is_empty() {
            return Err(Error::Dataset(format!("no images under {}", root.display())));
        }
        info!(
            root = %root.display(),
            classes = classes.len(),
            samples = samples.len(),
            "opened dataset"
        );
        Ok(ImageFolder {
            root: root.to_path_buf(),
            classes: classes.to_vec(),
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn ensure_dir(root: &Path) -> Result<()> {
    if root.is_dir() {
        Ok(())
    } else {
        Err(Error::DirectoryNotFound(root.to_path_buf()))
    }
}
