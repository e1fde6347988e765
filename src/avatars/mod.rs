pub mod services;

pub use services::{default_avatar_for, AvatarStorage, LocalAvatarStorage, TempUpload};
