pub mod fuse;
pub mod inspect;
pub mod normalize;

pub use fuse::FuseCommand;
pub use inspect::InspectCommand;
pub use normalize::NormalizeCommand;
