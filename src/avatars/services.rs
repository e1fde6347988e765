use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use image::{imageops::FilterType, ImageReader};
use md5::{Digest, Md5};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::dto::is_valid_email;
use crate::error::{AppError, AppResult};

pub const AVATAR_SIZE: u32 = 250;
pub const AVATAR_URL_PREFIX: &str = "avatars";

const GRAVATAR_BASE: &str = "//www.gravatar.com/avatar";
const GRAVATAR_PLACEHOLDER: &str = "00000000000000000000000000000000";

/// Gravatar URL for `email`. Malformed input gets the placeholder hash.
pub fn default_avatar_for(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    if !is_valid_email(&normalized) {
        return format!("{GRAVATAR_BASE}/{GRAVATAR_PLACEHOLDER}");
    }
    let digest = Md5::digest(normalized.as_bytes());
    format!("{GRAVATAR_BASE}/{}", hex::encode(digest))
}

/// An uploaded file staged on disk. The file is removed when this value is dropped.
pub struct TempUpload {
    file: NamedTempFile,
    original_name: String,
}

impl TempUpload {
    pub async fn stage(tmp_dir: &Path, original_name: &str, body: &[u8]) -> anyhow::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(tmp_dir)
            .with_context(|| format!("create temp file in {}", tmp_dir.display()))?;
        tokio::fs::write(file.path(), body)
            .await
            .context("write upload to temp file")?;
        Ok(Self {
            file,
            original_name: original_name.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }
}

#[async_trait]
pub trait AvatarStorage: Send + Sync {
    /// Normalizes the upload and stores it for `user_id`, returning the client-facing path.
    /// The staged file is gone when this returns, on success and on failure.
    async fn store(&self, user_id: Uuid, upload: TempUpload) -> AppResult<String>;
    async fn remove(&self, avatar_url: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalAvatarStorage {
    dir: PathBuf,
}

impl LocalAvatarStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Final path component of a client-supplied name.
fn sanitize_filename(original: &str) -> Option<String> {
    let name = Path::new(original.trim())
        .file_name()?
        .to_string_lossy()
        .into_owned();
    (!name.is_empty()).then_some(name)
}

fn resize_into(src: &Path, dir: &Path, dest: &Path) -> Result<(), String> {
    let reader = ImageReader::open(src)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| format!("cannot read upload: {e}"))?;
    let format = reader
        .format()
        .ok_or_else(|| "unrecognized image format".to_string())?;
    let image = reader
        .decode()
        .map_err(|e| format!("cannot decode image: {e}"))?;
    let resized = image.resize_exact(AVATAR_SIZE, AVATAR_SIZE, FilterType::Triangle);
    write_atomically(dir, dest, |out| {
        resized
            .write_to(out, format)
            .map_err(|e| format!("cannot encode avatar: {e}"))
    })
}

/// Writes into a temp file in `dir` and renames it over `dest` only once `write`
/// and the flush succeed. On failure `dest` is untouched and the temp file is gone.
fn write_atomically<F>(dir: &Path, dest: &Path, write: F) -> Result<(), String>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<(), String>,
{
    let mut tmp = tempfile::Builder::new()
        .prefix(".avatar-")
        .tempfile_in(dir)
        .map_err(|e| format!("cannot write avatar: {e}"))?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());
        write(&mut out)?;
        out.flush().map_err(|e| format!("cannot write avatar: {e}"))?;
    }
    tmp.persist(dest)
        .map_err(|e| format!("cannot write avatar: {e}"))?;
    Ok(())
}

#[async_trait]
impl AvatarStorage for LocalAvatarStorage {
    async fn store(&self, user_id: Uuid, upload: TempUpload) -> AppResult<String> {
        let name = sanitize_filename(upload.original_name())
            .ok_or_else(|| AppError::Upload("missing file name".into()))?;
        let filename = format!("{user_id}_{name}");
        let dir = self.dir.clone();
        let dest = dir.join(&filename);

        let result = tokio::task::spawn_blocking(move || {
            let res = resize_into(upload.path(), &dir, &dest);
            drop(upload);
            res
        })
        .await
        .context("avatar resize task")?;

        match result {
            Ok(()) => {
                debug!(%user_id, %filename, "avatar stored");
                Ok(format!("{AVATAR_URL_PREFIX}/{filename}"))
            }
            Err(msg) => {
                warn!(%user_id, error = %msg, "avatar upload rejected");
                Err(AppError::Upload(msg))
            }
        }
    }

    async fn remove(&self, avatar_url: &str) -> anyhow::Result<()> {
        let Some(name) = avatar_url
            .strip_prefix(AVATAR_URL_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(sanitize_filename)
        else {
            return Ok(());
        };
        match tokio::fs::remove_file(self.dir.join(&name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove avatar {name}")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn gravatar_url_is_md5_of_normalized_email() {
        let url = default_avatar_for("MyEmailAddress@example.com ");
        assert_eq!(
            url,
            "//www.gravatar.com/avatar/0bc83cb571cd1c50ba6f3e8a78ef1346"
        );
        assert_eq!(url, default_avatar_for("myemailaddress@example.com"));
    }

    #[test]
    fn malformed_email_gets_placeholder() {
        assert_eq!(
            default_avatar_for("not an email"),
            format!("//www.gravatar.com/avatar/{GRAVATAR_PLACEHOLDER}")
        );
        assert_eq!(default_avatar_for(""), default_avatar_for("@@"));
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("me.png").as_deref(), Some("me.png"));
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[tokio::test]
    async fn stores_resized_avatar_and_removes_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let avatars = tempfile::tempdir().unwrap();
        let storage = LocalAvatarStorage::new(avatars.path());
        let user_id = Uuid::new_v4();

        let upload = TempUpload::stage(tmp.path(), "me.png", &png_bytes(40, 90))
            .await
            .unwrap();
        let staged = upload.path().to_path_buf();

        let url = storage.store(user_id, upload).await.unwrap();
        assert_eq!(url, format!("avatars/{user_id}_me.png"));
        assert!(!staged.exists());

        let stored = image::open(avatars.path().join(format!("{user_id}_me.png"))).unwrap();
        assert_eq!((stored.width(), stored.height()), (AVATAR_SIZE, AVATAR_SIZE));
    }

    #[tokio::test]
    async fn undecodable_upload_fails_and_is_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let avatars = tempfile::tempdir().unwrap();
        let storage = LocalAvatarStorage::new(avatars.path());

        let upload = TempUpload::stage(tmp.path(), "notes.png", b"definitely not an image")
            .await
            .unwrap();
        let staged = upload.path().to_path_buf();

        let err = storage.store(Uuid::new_v4(), upload).await.unwrap_err();
        assert!(matches!(err, AppError::Upload(_)));
        assert!(!staged.exists());
        assert_eq!(std::fs::read_dir(avatars.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn write_failure_is_an_upload_error() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalAvatarStorage::new(tmp.path().join("missing-dir"));

        let upload = TempUpload::stage(tmp.path(), "me.png", &png_bytes(10, 10))
            .await
            .unwrap();
        let staged = upload.path().to_path_buf();

        let err = storage.store(Uuid::new_v4(), upload).await.unwrap_err();
        assert!(matches!(err, AppError::Upload(_)));
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn failed_replacement_keeps_previous_avatar() {
        let tmp = tempfile::tempdir().unwrap();
        let avatars = tempfile::tempdir().unwrap();
        let storage = LocalAvatarStorage::new(avatars.path());
        let user_id = Uuid::new_v4();
        let stored = avatars.path().join(format!("{user_id}_me.png"));

        let first = TempUpload::stage(tmp.path(), "me.png", &png_bytes(30, 30))
            .await
            .unwrap();
        storage.store(user_id, first).await.unwrap();
        let before = std::fs::read(&stored).unwrap();

        let broken = TempUpload::stage(tmp.path(), "me.png", b"GIF89a truncated")
            .await
            .unwrap();
        let err = storage.store(user_id, broken).await.unwrap_err();
        assert!(matches!(err, AppError::Upload(_)));

        assert_eq!(std::fs::read(&stored).unwrap(), before);
        let kept = image::open(&stored).unwrap();
        assert_eq!((kept.width(), kept.height()), (AVATAR_SIZE, AVATAR_SIZE));
        assert_eq!(std::fs::read_dir(avatars.path()).unwrap().count(), 1);
    }

    #[test]
    fn interrupted_write_leaves_destination_intact() {
        let avatars = tempfile::tempdir().unwrap();
        let dest = avatars.path().join("u_me.png");
        std::fs::write(&dest, b"previous avatar").unwrap();

        let err = write_atomically(avatars.path(), &dest, |out| {
            out.write_all(b"half an ima").unwrap();
            out.flush().unwrap();
            Err("disk full".to_string())
        })
        .unwrap_err();
        assert_eq!(err, "disk full");

        assert_eq!(std::fs::read(&dest).unwrap(), b"previous avatar");
        assert_eq!(std::fs::read_dir(avatars.path()).unwrap().count(), 1);
    }

    #[test]
    fn completed_write_replaces_destination() {
        let avatars = tempfile::tempdir().unwrap();
        let dest = avatars.path().join("u_me.png");
        std::fs::write(&dest, b"previous avatar").unwrap();

        write_atomically(avatars.path(), &dest, |out| {
            out.write_all(b"new avatar")
                .map_err(|e| e.to_string())
        })
        .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"new avatar");
        assert_eq!(std::fs::read_dir(avatars.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn remove_deletes_stored_avatar() {
        let tmp = tempfile::tempdir().unwrap();
        let avatars = tempfile::tempdir().unwrap();
        let storage = LocalAvatarStorage::new(avatars.path());
        let user_id = Uuid::new_v4();

        let upload = TempUpload::stage(tmp.path(), "a.png", &png_bytes(5, 5)).await.unwrap();
        let url = storage.store(user_id, upload).await.unwrap();
        storage.remove(&url).await.unwrap();
        assert!(!avatars.path().join(format!("{user_id}_a.png")).exists());
        // second removal is a no-op
        storage.remove(&url).await.unwrap();
    }
}
