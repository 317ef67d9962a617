//! メモリセグメント

use bitflags::bitflags;

/// ダンプにもガジェット探索にも使わないカーネル提供のセグメント
pub const KERNEL_SEGMENTS: [&str; 3] = ["[vvar]", "[vdso]", "[vsyscall]"];

bitflags! {
    /// セグメントのアクセス権限
    ///
    /// ビット値はUZL形式の権限ビットと同じです。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Permissions: u8 {
        const READ = seedsnap_uzl::PERM_READ;
        const WRITE = seedsnap_uzl::PERM_WRITE;
        const EXECUTE = seedsnap_uzl::PERM_EXECUTE;
    }
}

impl Permissions {
    /// `r-xp` 形式の権限文字列から権限を得る
    pub fn from_perm_string(s: &str) -> Self {
        let mut perms = Permissions::empty();
        if s.contains('r') {
            perms |= Permissions::READ;
        }
        if s.contains('w') {
            perms |= Permissions::WRITE;
        }
        if s.contains('x') {
            perms |= Permissions::EXECUTE;
        }
        perms
    }

    /// `rwx` 形式の3文字
    pub fn to_perm_string(self) -> String {
        [
            (Permissions::READ, 'r'),
            (Permissions::WRITE, 'w'),
            (Permissions::EXECUTE, 'x'),
        ]
        .iter()
        .map(|&(flag, c)| if self.contains(flag) { c } else { '-' })
        .collect()
    }
}

/// ターゲットの連続した仮想アドレス範囲
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    start: u64,
    end: u64,
    perms: Permissions,
    name: Option<String>,
}

impl Segment {
    /// セグメントを作成する
    ///
    /// `end <= start` の場合は空の範囲なので `None` を返します。
    pub fn new(start: u64, end: u64, perms: Permissions, name: Option<String>) -> Option<Self> {
        if end <= start {
            return None;
        }
        Some(Self {
            start,
            end,
            perms,
            name,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// サイズ（常に正）
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn perms(&self) -> Permissions {
        self.perms
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_readable(&self) -> bool {
        self.perms.contains(Permissions::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.perms.contains(Permissions::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.perms.contains(Permissions::EXECUTE)
    }

    /// `[vdso]` などカーネル提供のセグメントかどうか
    pub fn is_kernel(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|name| KERNEL_SEGMENTS.contains(&name))
    }

    /// ダンプ対象かどうか（読み取り可能で、カーネル提供でない）
    pub fn is_dumpable(&self) -> bool {
        self.is_readable() && !self.is_kernel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perm_string_round() {
        let perms = Permissions::from_perm_string("r-xp");
        assert_eq!(perms, Permissions::READ | Permissions::EXECUTE);
        assert_eq!(perms.to_perm_string(), "r-x");
        assert_eq!(Permissions::from_perm_string("---p"), Permissions::empty());
        assert_eq!(Permissions::all().bits(), 0x07);
    }

    #[test]
    fn test_segment_rejects_empty_range() {
        assert!(Segment::new(0x1000, 0x1000, Permissions::READ, None).is_none());
        assert!(Segment::new(0x2000, 0x1000, Permissions::READ, None).is_none());

        let seg = Segment::new(0x1000, 0x3000, Permissions::READ, None).unwrap();
        assert_eq!(seg.size(), 0x2000);
    }

    #[test]
    fn test_kernel_segments_not_dumpable() {
        for name in KERNEL_SEGMENTS {
            let seg = Segment::new(
                0x7fff0000,
                0x7fff2000,
                Permissions::READ | Permissions::EXECUTE,
                Some(name.to_string()),
            )
            .unwrap();
            assert!(seg.is_kernel());
            assert!(!seg.is_dumpable());
        }

        let stack = Segment::new(0x1000, 0x2000, Permissions::READ, Some("[stack]".into())).unwrap();
        assert!(stack.is_dumpable());

        let guard = Segment::new(0x1000, 0x2000, Permissions::empty(), None).unwrap();
        assert!(!guard.is_dumpable());
    }
}
