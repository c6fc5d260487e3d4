/// The ready marker the debugger prints before reading the next command.
///
/// A match only counts at the start of a line, so command output that
/// happens to contain the marker text mid-line is never mistaken for a
/// boundary. The marker includes its trailing delimiter (`"(lldb) "`), which
/// keeps `(lldb)` on its own from matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PromptMarker {
    bytes: Vec<u8>,
}

impl PromptMarker {
    pub(crate) fn new(marker: &str) -> Self {
        Self {
            bytes: marker.as_bytes().to_vec(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Offset of the first complete marker that starts a line.
    pub(crate) fn find_boundary(&self, haystack: &[u8]) -> Option<usize> {
        if self.bytes.is_empty() || haystack.len() < self.bytes.len() {
            return None;
        }
        haystack
            .windows(self.bytes.len())
            .enumerate()
            .find(|(pos, window)| {
                *window == self.bytes.as_slice() && (*pos == 0 || haystack[*pos - 1] == b'\n')
            })
            .map(|(pos, _)| pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lldb() -> PromptMarker {
        PromptMarker::new("(lldb) ")
    }

    #[test]
    fn marker_at_start_of_buffer() {
        assert_eq!(lldb().find_boundary(b"(lldb) "), Some(0));
    }

    #[test]
    fn marker_after_output_line() {
        let buf = b"Breakpoint 1: where = a.out`main\n(lldb) ";
        assert_eq!(lldb().find_boundary(buf), Some(33));
    }

    #[test]
    fn mid_line_marker_is_ignored() {
        let buf = b"(char *) $0 = \"(lldb) \"\n";
        assert_eq!(lldb().find_boundary(buf), None);
    }

    #[test]
    fn marker_without_delimiter_is_incomplete() {
        assert_eq!(lldb().find_boundary(b"output\n(lldb)"), None);
        assert_eq!(lldb().find_boundary(b"output\n(ll"), None);
    }

    #[test]
    fn first_of_several_markers_wins() {
        let buf = b"a\n(lldb) b\n(lldb) ";
        assert_eq!(lldb().find_boundary(buf), Some(2));
    }
}
