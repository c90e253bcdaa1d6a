use anyhow::{Context, Result};
use flate2::{read::GzDecoder, Compression, GzBuilder};
use std::{
	fs,
	io,
	path::{Path, PathBuf},
};
use tar::{EntryType, Header};

use crate::constants::MAGIC_TIMESTAMP;

/// Disk layout of the two artifact roots: per-authority secrets under the
/// private root, published material under the public root.
#[derive(Debug, Clone)]
pub struct DataLayout {
	private_root: PathBuf,
	public_root: PathBuf,
}

impl DataLayout {
	pub fn new(private_root: PathBuf, public_root: PathBuf) -> Self {
		Self { private_root, public_root }
	}

	pub fn election_private_dir(&self, election_id: i64) -> PathBuf {
		self.private_root.join(election_id.to_string())
	}

	pub fn session_private_dir(&self, election_id: i64, session_id: &str) -> PathBuf {
		self.election_private_dir(election_id).join(session_id)
	}

	pub fn election_public_dir(&self, election_id: i64) -> PathBuf {
		self.public_root.join(election_id.to_string())
	}

	pub fn session_public_dir(&self, election_id: i64, session_id: &str) -> PathBuf {
		self.election_public_dir(election_id).join(session_id)
	}

	pub fn tally_archive_path(&self, election_id: i64) -> PathBuf {
		self.election_public_dir(election_id).join("tally.tar.gz")
	}

	pub fn tally_hash_path(&self, election_id: i64) -> PathBuf {
		self.election_public_dir(election_id).join("tally.tar.gz.sha256")
	}

	pub fn tally_approved_path(&self, election_id: i64) -> PathBuf {
		self.election_private_dir(election_id).join("tally_approved")
	}

	pub fn privinfo_path(&self, election_id: i64, session_id: &str) -> PathBuf {
		self.session_private_dir(election_id, session_id).join("privInfo.xml")
	}
}

/// The `.sha256` sidecar guarding a file against silent replacement.
pub fn sidecar_path(path: &Path) -> PathBuf {
	let mut name = path.as_os_str().to_owned();
	name.push(".sha256");
	PathBuf::from(name)
}

pub fn ensure_dir(path: &Path) -> Result<()> {
	fs::create_dir_all(path).with_context(|| format!("cannot create {}", path.display()))
}

/// Copy a private artifact into the public tree, creating parents.
pub fn publish(source: &Path, dest: &Path) -> Result<()> {
	if let Some(parent) = dest.parent() {
		ensure_dir(parent)?;
	}
	fs::copy(source, dest)
		.with_context(|| format!("cannot publish {} to {}", source.display(), dest.display()))?;
	Ok(())
}

/// One staged path and the name it gets inside the archive.
#[derive(Debug, Clone)]
pub struct TarEntry {
	pub source: PathBuf,
	pub archive_name: String,
}

impl TarEntry {
	pub fn new(source: PathBuf, archive_name: impl Into<String>) -> Self {
		Self { source, archive_name: archive_name.into() }
	}
}

/// Write a `.tar.gz` whose bytes depend only on the logical content of its
/// entries: fixed mtime/uid/gid/mode, empty user names, directory children
/// in sorted order, relative archive names, and a gzip stream with no
/// embedded timestamp. Every authority must produce the identical file.
pub fn create_deterministic_tarball(dest: &Path, entries: &[TarEntry]) -> Result<()> {
	if let Some(parent) = dest.parent() {
		ensure_dir(parent)?;
	}
	let file = fs::File::create(dest)
		.with_context(|| format!("cannot create {}", dest.display()))?;
	let gz = GzBuilder::new().mtime(0).write(file, Compression::default());
	let mut builder = tar::Builder::new(gz);
	for entry in entries {
		append_path(&mut builder, &entry.source, &entry.archive_name)
			.with_context(|| format!("cannot archive {}", entry.source.display()))?;
	}
	let gz = builder.into_inner().context("cannot finish tar stream")?;
	gz.finish().context("cannot finish gzip stream")?;
	Ok(())
}

fn append_path<W: io::Write>(
	builder: &mut tar::Builder<W>,
	source: &Path,
	archive_name: &str,
) -> Result<()> {
	let metadata = fs::metadata(source)
		.with_context(|| format!("cannot stat {}", source.display()))?;
	if metadata.is_dir() {
		let mut header = Header::new_gnu();
		header.set_entry_type(EntryType::Directory);
		header.set_size(0);
		header.set_mode(0o755);
		set_fixed_metadata(&mut header)?;
		builder.append_data(&mut header, format!("{archive_name}/"), io::empty())?;

		let mut children = fs::read_dir(source)?.collect::<io::Result<Vec<_>>>()?;
		// Sort, or the archive depends on directory enumeration order.
		children.sort_by_key(|child| child.file_name());
		for child in children {
			let name = child.file_name().to_string_lossy().into_owned();
			append_path(builder, &child.path(), &format!("{archive_name}/{name}"))?;
		}
	} else {
		let mut header = Header::new_gnu();
		header.set_entry_type(EntryType::Regular);
		header.set_size(metadata.len());
		header.set_mode(0o644);
		set_fixed_metadata(&mut header)?;
		let file = fs::File::open(source)?;
		builder.append_data(&mut header, archive_name, file)?;
	}
	Ok(())
}

fn set_fixed_metadata(header: &mut Header) -> Result<()> {
	header.set_uid(1000);
	header.set_gid(100);
	header.set_mtime(MAGIC_TIMESTAMP);
	header.set_username("")?;
	header.set_groupname("")?;
	Ok(())
}

pub fn extract_tarball(source: &Path, dest: &Path) -> Result<()> {
	let file = fs::File::open(source)
		.with_context(|| format!("cannot open {}", source.display()))?;
	let mut archive = tar::Archive::new(GzDecoder::new(file));
	archive
		.unpack(dest)
		.with_context(|| format!("cannot extract {} to {}", source.display(), dest.display()))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Read;

	fn stage(dir: &Path, files: &[(&str, &str)]) {
		for (name, content) in files {
			let path = dir.join(name);
			ensure_dir(path.parent().unwrap()).unwrap();
			fs::write(path, content).unwrap();
		}
	}

	#[test]
	fn archives_are_bit_identical_across_stagings() {
		let tmp = tempfile::tempdir().unwrap();

		// Same logical content staged twice, written in different order so
		// directory enumeration and inode timestamps differ.
		let first = tmp.path().join("first");
		stage(&first, &[("proofs/b", "bee"), ("proofs/a", "aye"), ("plaintexts_json", "[]")]);
		let second = tmp.path().join("second");
		stage(&second, &[("plaintexts_json", "[]"), ("proofs/a", "aye"), ("proofs/b", "bee")]);

		let entries = |root: &Path| {
			vec![
				TarEntry::new(root.join("plaintexts_json"), "plaintexts_json"),
				TarEntry::new(root.join("proofs"), "proofs"),
			]
		};
		let first_tar = tmp.path().join("first.tar.gz");
		let second_tar = tmp.path().join("second.tar.gz");
		create_deterministic_tarball(&first_tar, &entries(&first)).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(20));
		create_deterministic_tarball(&second_tar, &entries(&second)).unwrap();

		assert_eq!(fs::read(first_tar).unwrap(), fs::read(second_tar).unwrap());
	}

	#[test]
	fn entries_carry_fixed_metadata_in_sorted_order() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("staged");
		stage(&root, &[("dir/zz", "1"), ("dir/aa", "2"), ("dir/mm", "3")]);

		let archive_path = tmp.path().join("out.tar.gz");
		create_deterministic_tarball(
			&archive_path,
			&[TarEntry::new(root.join("dir"), "dir")],
		)
		.unwrap();

		let mut archive =
			tar::Archive::new(GzDecoder::new(fs::File::open(&archive_path).unwrap()));
		let mut names = Vec::new();
		for entry in archive.entries().unwrap() {
			let entry = entry.unwrap();
			let header = entry.header();
			assert_eq!(header.mtime().unwrap(), MAGIC_TIMESTAMP);
			assert_eq!(header.uid().unwrap(), 1000);
			assert_eq!(header.gid().unwrap(), 100);
			names.push(entry.path().unwrap().to_string_lossy().into_owned());
		}
		assert_eq!(names, vec!["dir/", "dir/aa", "dir/mm", "dir/zz"]);
	}

	#[test]
	fn extraction_round_trips_contents() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("staged");
		stage(&root, &[("session-1/privInfo.xml", "<xml/>")]);

		let archive_path = tmp.path().join("keys.tar.gz");
		create_deterministic_tarball(
			&archive_path,
			&[TarEntry::new(root.join("session-1"), "session-1")],
		)
		.unwrap();

		let out = tmp.path().join("restored");
		extract_tarball(&archive_path, &out).unwrap();
		let mut content = String::new();
		fs::File::open(out.join("session-1/privInfo.xml"))
			.unwrap()
			.read_to_string(&mut content)
			.unwrap();
		assert_eq!(content, "<xml/>");
	}
}
