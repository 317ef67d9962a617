//! ローカルの成果物ディレクトリ

use crate::segment::Segment;
use crate::Result;
use std::path::PathBuf;

/// プロセスIDごとの成果物ディレクトリ
///
/// `<root>/seedsnap_<pid>/` 以下にセグメントのダンプとレジスタのダンプを置きます。
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// プロセスのディレクトリ（作成はしない）
    pub fn dir(&self, pid: u32) -> PathBuf {
        self.root.join(format!("seedsnap_{}", pid))
    }

    /// ファイルのパスを返す
    ///
    /// ディレクトリが無ければ作成します（既にあっても成功します）。
    pub fn path(&self, pid: u32, file_name: &str) -> Result<PathBuf> {
        let dir = self.dir(pid);
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(file_name))
    }

    /// セグメントのダンプファイルのパス
    ///
    /// ダンプ処理とガジェット探索は必ずこの名前で同じファイルを参照します。
    pub fn segment_path(&self, pid: u32, segment: &Segment) -> Result<PathBuf> {
        self.path(pid, &segment_file_name(segment))
    }
}

/// `<start>.<perms>` 形式のファイル名
pub fn segment_file_name(segment: &Segment) -> String {
    format!("0x{:x}.{}", segment.start(), segment.perms().to_perm_string())
}
