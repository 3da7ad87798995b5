pub mod dataset;
pub mod image;
pub mod loader;

pub use self::dataset::{ImageFolder, Sample};
pub use self::image::{ImageTensor, Preprocessor, TrainAugment};
pub use self::loader::{Batch, BatchIter, DataLoader, LoaderOptions, Transform};
