//! Sub-invocation extraction for shell command lines.
//!
//! Every simple command inside a command line becomes a [`ShellInvocation`],
//! including commands nested in substitutions. Nested substitutions are
//! masked as `$(...)` in the outer invocation's policy text so rules written
//! for the outer command never match on nested content by accident; the
//! nested commands are reported as invocations of their own, after the
//! command that contains them.
//!
//! Bash is parsed with tree-sitter. PowerShell has no tree-sitter grammar in
//! our stack, so it goes through a small tokenizer that understands quoting,
//! statement separators, sub-expressions and script blocks.

use tree_sitter::{Node, Parser};

use crate::core::types::ToolKind;

/// Placeholder that replaces nested command substitutions in policy text.
pub const NESTED_PLACEHOLDER: &str = "$(...)";

/// One simple command found in a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    /// Source text of the invocation.
    pub text: String,
    /// Arguments with surrounding quotes removed.
    pub argv: Vec<String>,
    /// `argv[0]`, or `argv[0] argv[1]` when `argv[1]` reads like a subcommand.
    pub signature: String,
    /// Space-joined tokens with nested substitutions masked.
    pub policy_text: String,
    /// Files named by redirections (`>`, `>>`, `<`, `2>` ...), quotes removed.
    /// Descriptor duplications such as `2>&1` are not listed.
    pub redirects: Vec<String>,
}

/// A single argument as written and with nested substitutions masked.
#[derive(Debug, Clone)]
struct Word {
    raw: String,
    masked: String,
}

/// Extract all invocations for `command` in the dialect of `tool`.
///
/// Builtin commands have no shell structure and yield nothing.
pub fn extract_invocations(command: &str, tool: ToolKind) -> Vec<ShellInvocation> {
    match tool {
        ToolKind::Bash => extract_bash(command),
        ToolKind::PowerShell => extract_powershell(command),
        ToolKind::Builtin => Vec::new(),
    }
}

/// Unique signatures in first-seen order.
pub fn extract_signatures(command: &str, tool: ToolKind) -> Vec<String> {
    let mut signatures: Vec<String> = Vec::new();
    for invocation in extract_invocations(command, tool) {
        if !signatures.contains(&invocation.signature) {
            signatures.push(invocation.signature);
        }
    }
    signatures
}

fn build_invocation(text: &str, words: &[Word], redirects: Vec<String>) -> Option<ShellInvocation> {
    let words: Vec<&Word> = words.iter().filter(|w| !w.raw.trim().is_empty()).collect();
    let argv: Vec<String> = words
        .iter()
        .map(|w| strip_quotes(&w.raw))
        .filter(|token| !token.is_empty())
        .collect();
    let Some(first) = argv.first() else {
        return (!redirects.is_empty()).then(|| redirect_only(text, redirects));
    };

    let signature = match argv.get(1) {
        Some(second) if looks_like_subcommand(second) => format!("{first} {second}"),
        _ => first.clone(),
    };
    let policy_text = words
        .iter()
        .map(|w| strip_quotes(&w.masked))
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Some(ShellInvocation {
        text: text.trim().to_string(),
        argv,
        signature,
        policy_text,
        redirects,
    })
}

/// A redirection with no command word, e.g. `> file` truncating a file.
fn redirect_only(text: &str, redirects: Vec<String>) -> ShellInvocation {
    ShellInvocation {
        text: text.trim().to_string(),
        argv: Vec::new(),
        signature: String::new(),
        policy_text: String::new(),
        redirects,
    }
}

/// `2>&1`, `>&-` and friends duplicate descriptors instead of naming files.
fn is_descriptor_target(target: &str) -> bool {
    target == "-" || (!target.is_empty() && target.bytes().all(|b| b.is_ascii_digit()))
}

fn looks_like_subcommand(token: &str) -> bool {
    !token.is_empty()
        && !token.starts_with('-')
        && !token.starts_with('/')
        && !token.starts_with("$(")
}

fn strip_quotes(token: &str) -> String {
    token
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string()
}

// ---------------------------------------------------------------------------
// bash
// ---------------------------------------------------------------------------

fn extract_bash(command: &str) -> Vec<ShellInvocation> {
    let mut parser = Parser::new();
    if parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .is_err()
    {
        return Vec::new();
    }
    let Some(tree) = parser.parse(command, None) else {
        return Vec::new();
    };

    let mut invocations = Vec::new();
    collect_bash(tree.root_node(), command.as_bytes(), &mut invocations);
    invocations
}

fn collect_bash(node: Node<'_>, src: &[u8], out: &mut Vec<ShellInvocation>) {
    match node.kind() {
        "command" => {
            let mut words = Vec::new();
            let mut redirects = Vec::new();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "file_redirect" {
                    redirects.extend(bash_redirect_target(child, src));
                }
                if child.kind() == "variable_assignment" || child.kind().ends_with("redirect") {
                    continue;
                }
                words.push(Word {
                    raw: node_text(child, src),
                    masked: mask_bash_substitutions(child, src),
                });
            }
            if let Some(invocation) = build_invocation(&node_text(node, src), &words, redirects) {
                out.push(invocation);
            }
        }
        "redirected_statement" => {
            let first = out.len();
            let mut redirects = Vec::new();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "file_redirect" {
                    redirects.extend(bash_redirect_target(child, src));
                    collect_bash_children(child, src, out);
                } else {
                    collect_bash(child, src, out);
                }
            }
            if redirects.is_empty() {
                return;
            }
            match out.get_mut(first) {
                Some(body) => body.redirects.extend(redirects),
                None => out.push(redirect_only(&node_text(node, src), redirects)),
            }
            return;
        }
        // A redirection the grammar could not attach to a statement.
        "file_redirect" => {
            let redirects: Vec<String> = bash_redirect_target(node, src).into_iter().collect();
            if !redirects.is_empty() {
                out.push(redirect_only(&node_text(node, src), redirects));
            }
        }
        _ => {}
    }

    collect_bash_children(node, src, out);
}

fn collect_bash_children(node: Node<'_>, src: &[u8], out: &mut Vec<ShellInvocation>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if node.kind() == "command" && child.kind() == "file_redirect" {
            // Only substitutions inside the target matter here.
            collect_bash_children(child, src, out);
            continue;
        }
        collect_bash(child, src, out);
    }
}

/// Destination of a `file_redirect`, skipping its descriptor number.
fn bash_redirect_target(node: Node<'_>, src: &[u8]) -> Option<String> {
    let mut cursor = node.walk();
    let target: String = node
        .named_children(&mut cursor)
        .filter(|child| child.kind() != "file_descriptor")
        .map(|child| strip_quotes(&node_text(child, src)))
        .collect::<Vec<_>>()
        .join(" ");
    (!target.is_empty() && !is_descriptor_target(&target)).then_some(target)
}

fn is_bash_substitution(node: Node<'_>) -> bool {
    matches!(node.kind(), "command_substitution" | "process_substitution")
}

fn mask_bash_substitutions(node: Node<'_>, src: &[u8]) -> String {
    if is_bash_substitution(node) {
        return NESTED_PLACEHOLDER.to_string();
    }
    let mut ranges = Vec::new();
    find_bash_substitutions(node, &mut ranges);

    let mut masked = String::new();
    let mut pos = node.start_byte();
    for (start, end) in ranges {
        masked.push_str(&String::from_utf8_lossy(&src[pos..start]));
        masked.push_str(NESTED_PLACEHOLDER);
        pos = end;
    }
    masked.push_str(&String::from_utf8_lossy(&src[pos..node.end_byte()]));
    masked
}

fn find_bash_substitutions(node: Node<'_>, ranges: &mut Vec<(usize, usize)>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if is_bash_substitution(child) {
            ranges.push((child.start_byte(), child.end_byte()));
        } else {
            find_bash_substitutions(child, ranges);
        }
    }
}

fn node_text(node: Node<'_>, src: &[u8]) -> String {
    node.utf8_text(src).unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// PowerShell
// ---------------------------------------------------------------------------

fn extract_powershell(command: &str) -> Vec<ShellInvocation> {
    let mut invocations = Vec::new();
    for statement in PsLexer::new(command).statements() {
        let (words, redirects) = split_ps_redirects(strip_assignment(&statement.words));
        if let Some(invocation) = build_invocation(&statement.text, &words, redirects) {
            invocations.push(invocation);
        }
        for inner in &statement.nested {
            invocations.extend(extract_powershell(inner));
        }
    }
    invocations
}

/// Drop a leading `$var =` so the signature names the command being run.
fn strip_assignment(words: &[Word]) -> &[Word] {
    match words {
        [target, op, rest @ ..]
            if target.raw.starts_with('$')
                && matches!(op.raw.as_str(), "=" | "+=" | "-=" | "*=" | "/=") =>
        {
            rest
        }
        _ => words,
    }
}

/// Separate `> file`, `2>>file`, `*> file` and `< file` from the arguments.
fn split_ps_redirects(words: &[Word]) -> (Vec<Word>, Vec<String>) {
    let mut kept = Vec::new();
    let mut redirects = Vec::new();
    let mut iter = words.iter();
    while let Some(word) = iter.next() {
        let Some(rest) = ps_redirect_rest(&word.raw) else {
            kept.push(word.clone());
            continue;
        };
        let target = if rest.is_empty() {
            iter.next().map(|next| strip_quotes(&next.raw))
        } else {
            Some(strip_quotes(rest))
        };
        if let Some(target) = target
            && !target.is_empty()
            && !target.starts_with('&')
        {
            redirects.push(target);
        }
    }
    (kept, redirects)
}

/// Text after a redirection operator at the start of `raw`, if any.
fn ps_redirect_rest(raw: &str) -> Option<&str> {
    let rest = raw.trim_start_matches(|c: char| c.is_ascii_digit() || c == '*');
    let stream_prefix = rest.len() != raw.len();
    if let Some(after) = rest.strip_prefix(">>").or_else(|| rest.strip_prefix('>')) {
        return Some(after);
    }
    if !stream_prefix {
        return rest.strip_prefix('<');
    }
    None
}

#[derive(Debug, Default)]
struct PsStatement {
    text: String,
    words: Vec<Word>,
    /// Sources of sub-expressions and script blocks, in order of appearance.
    nested: Vec<String>,
}

/// Char-level tokenizer for PowerShell command lines.
struct PsLexer {
    chars: Vec<char>,
    pos: usize,
}

impl PsLexer {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn statements(mut self) -> Vec<PsStatement> {
        let mut statements = Vec::new();
        let mut current = PsStatement::default();
        let mut word: Option<Word> = None;
        let mut start = 0;

        while let Some(c) = self.peek() {
            match c {
                '\n' | ';' | '|' => {
                    finish_word(&mut current, &mut word);
                    self.finish_statement(&mut statements, &mut current, start);
                    self.pos += 1;
                    if c == '|' && self.peek() == Some('|') {
                        self.pos += 1;
                    }
                    start = self.pos;
                }
                '&' => {
                    finish_word(&mut current, &mut word);
                    if self.peek_at(1) == Some('&') {
                        self.finish_statement(&mut statements, &mut current, start);
                        self.pos += 2;
                        start = self.pos;
                    } else if current.words.is_empty() {
                        // call operator: `& 'tool.exe' args`
                        self.pos += 1;
                        start = self.pos;
                    } else {
                        self.finish_statement(&mut statements, &mut current, start);
                        self.pos += 1;
                        start = self.pos;
                    }
                }
                '#' if word.is_none() => {
                    finish_word(&mut current, &mut word);
                    while let Some(next) = self.peek() {
                        if next == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                c if c.is_whitespace() => {
                    finish_word(&mut current, &mut word);
                    self.pos += 1;
                }
                '`' => {
                    self.pos += 1;
                    match self.peek() {
                        // line continuation
                        Some('\n') => {
                            finish_word(&mut current, &mut word);
                            self.pos += 1;
                        }
                        Some(escaped) => {
                            let w = word.get_or_insert_with(empty_word);
                            w.raw.push('`');
                            w.raw.push(escaped);
                            w.masked.push(escaped);
                            self.pos += 1;
                        }
                        None => {}
                    }
                }
                '\'' => {
                    let quoted = self.read_single_quoted();
                    let w = word.get_or_insert_with(empty_word);
                    w.raw.push_str(&quoted);
                    w.masked.push_str(&quoted);
                }
                '"' => {
                    let (raw, masked) = self.read_double_quoted(&mut current.nested);
                    let w = word.get_or_insert_with(empty_word);
                    w.raw.push_str(&raw);
                    w.masked.push_str(&masked);
                }
                '$' | '@' if self.peek_at(1) == Some('(') => {
                    self.pos += 2;
                    let inner = self.read_group('(', ')');
                    let w = word.get_or_insert_with(empty_word);
                    w.raw.push(c);
                    w.raw.push('(');
                    w.raw.push_str(&inner);
                    w.raw.push(')');
                    w.masked.push_str(NESTED_PLACEHOLDER);
                    current.nested.push(inner);
                }
                '(' | '{' => {
                    let close = if c == '(' { ')' } else { '}' };
                    self.pos += 1;
                    let inner = self.read_group(c, close);
                    let w = word.get_or_insert_with(empty_word);
                    w.raw.push(c);
                    w.raw.push_str(&inner);
                    w.raw.push(close);
                    w.masked.push(c);
                    w.masked.push_str("...");
                    w.masked.push(close);
                    current.nested.push(inner);
                }
                other => {
                    let w = word.get_or_insert_with(empty_word);
                    w.raw.push(other);
                    w.masked.push(other);
                    self.pos += 1;
                }
            }
        }

        finish_word(&mut current, &mut word);
        self.finish_statement(&mut statements, &mut current, start);
        statements
    }

    fn finish_statement(
        &self,
        statements: &mut Vec<PsStatement>,
        current: &mut PsStatement,
        start: usize,
    ) {
        let mut statement = std::mem::take(current);
        if statement.words.is_empty() && statement.nested.is_empty() {
            return;
        }
        let end = self.pos.min(self.chars.len());
        statement.text = self.chars[start.min(end)..end].iter().collect();
        statements.push(statement);
    }

    /// Read `'...'` including the quotes; `''` is an escaped quote.
    fn read_single_quoted(&mut self) -> String {
        let mut out = String::from('\'');
        self.pos += 1;
        while let Some(c) = self.peek() {
            self.pos += 1;
            out.push(c);
            if c == '\'' {
                if self.peek() == Some('\'') {
                    out.push('\'');
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        out
    }

    /// Read `"..."` including the quotes. Sub-expressions inside the string
    /// are masked and recorded as nested sources.
    fn read_double_quoted(&mut self, nested: &mut Vec<String>) -> (String, String) {
        let mut raw = String::from('"');
        let mut masked = String::from('"');
        self.pos += 1;
        while let Some(c) = self.peek() {
            match c {
                '`' => {
                    self.pos += 1;
                    raw.push('`');
                    if let Some(escaped) = self.peek() {
                        raw.push(escaped);
                        masked.push(escaped);
                        self.pos += 1;
                    }
                }
                '"' if self.peek_at(1) == Some('"') => {
                    raw.push_str("\"\"");
                    masked.push('"');
                    self.pos += 2;
                }
                '"' => {
                    raw.push('"');
                    masked.push('"');
                    self.pos += 1;
                    break;
                }
                '$' if self.peek_at(1) == Some('(') => {
                    self.pos += 2;
                    let inner = self.read_group('(', ')');
                    raw.push_str("$(");
                    raw.push_str(&inner);
                    raw.push(')');
                    masked.push_str(NESTED_PLACEHOLDER);
                    nested.push(inner);
                }
                other => {
                    raw.push(other);
                    masked.push(other);
                    self.pos += 1;
                }
            }
        }
        (raw, masked)
    }

    /// Read up to the matching `close`, skipping quoted text. The opening
    /// delimiter has already been consumed; the closing one is consumed but
    /// not returned. An unterminated group runs to the end of input.
    fn read_group(&mut self, open: char, close: char) -> String {
        let mut depth = 1usize;
        let mut inner = String::new();
        while let Some(c) = self.peek() {
            if c == '\'' {
                inner.push_str(&self.read_single_quoted());
                continue;
            }
            if c == '"' {
                let mut ignored = Vec::new();
                let (raw, _) = self.read_double_quoted(&mut ignored);
                inner.push_str(&raw);
                continue;
            }
            self.pos += 1;
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            inner.push(c);
        }
        inner
    }
}

fn empty_word() -> Word {
    Word {
        raw: String::new(),
        masked: String::new(),
    }
}

fn finish_word(statement: &mut PsStatement, word: &mut Option<Word>) {
    if let Some(w) = word.take()
        && !w.raw.is_empty()
    {
        statement.words.push(w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signatures(command: &str, tool: ToolKind) -> Vec<String> {
        extract_invocations(command, tool)
            .into_iter()
            .map(|inv| inv.signature)
            .collect()
    }

    #[test]
    fn bash_pipeline_yields_each_command() {
        assert_eq!(
            signatures("ls -la | grep foo && git status", ToolKind::Bash),
            vec!["ls", "grep foo", "git status"]
        );
    }

    #[test]
    fn bash_signature_skips_flags_and_paths() {
        assert_eq!(signatures("git -C repo status", ToolKind::Bash), vec!["git"]);
        assert_eq!(signatures("cat /etc/hosts", ToolKind::Bash), vec!["cat"]);
    }

    #[test]
    fn bash_nested_substitution_is_masked_and_extracted() {
        let invocations = extract_invocations("git push $(git push --force)", ToolKind::Bash);
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].signature, "git push");
        assert_eq!(invocations[0].policy_text, "git push $(...)");
        assert_eq!(invocations[1].policy_text, "git push --force");
    }

    #[test]
    fn bash_deeply_nested_substitutions() {
        let invocations = extract_invocations(
            r#"git push $(git commit -m "x" $(git diff | xxx --force))"#,
            ToolKind::Bash,
        );
        let policies: Vec<&str> = invocations.iter().map(|i| i.policy_text.as_str()).collect();
        assert_eq!(policies[0], "git push $(...)");
        assert_eq!(policies[1], "git commit -m x $(...)");
        assert!(policies.contains(&"git diff"));
        assert!(policies.contains(&"xxx --force"));
    }

    #[test]
    fn bash_quotes_are_stripped_from_argv() {
        let invocations = extract_invocations(r#"echo "hello world" 'x'"#, ToolKind::Bash);
        assert_eq!(invocations[0].argv, vec!["echo", "hello world", "x"]);
    }

    #[test]
    fn bash_assignments_and_redirects_are_not_arguments() {
        let invocations = extract_invocations("FOO=1 make build > out.log", ToolKind::Bash);
        assert_eq!(invocations[0].argv, vec!["make", "build"]);
        assert_eq!(invocations[0].redirects, vec!["out.log"]);
    }

    #[test]
    fn bash_redirect_targets_are_collected() {
        let invocations =
            extract_invocations("cat < in.txt 2>&1 | tee \"out dir/x\" >> /tmp/log", ToolKind::Bash);
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].redirects, vec!["in.txt"]);
        assert_eq!(invocations[1].signature, "tee out dir/x");
        assert_eq!(invocations[1].redirects, vec!["/tmp/log"]);
    }

    #[test]
    fn powershell_redirects_are_split_from_arguments() {
        let invocations =
            extract_invocations("Get-Date -Format o > stamp.txt; git log 2>> err.txt", ToolKind::PowerShell);
        assert_eq!(invocations[0].argv, vec!["Get-Date", "-Format", "o"]);
        assert_eq!(invocations[0].redirects, vec!["stamp.txt"]);
        assert_eq!(invocations[1].argv, vec!["git", "log"]);
        assert_eq!(invocations[1].redirects, vec!["err.txt"]);
    }

    #[test]
    fn powershell_statements_and_pipes() {
        assert_eq!(
            signatures(
                "Get-ChildItem -Path . | Select-Object Name; git status",
                ToolKind::PowerShell
            ),
            vec!["Get-ChildItem", "Select-Object Name", "git status"]
        );
    }

    #[test]
    fn powershell_subexpression_is_masked() {
        let invocations =
            extract_invocations("git push $(git push --force)", ToolKind::PowerShell);
        assert_eq!(invocations[0].policy_text, "git push $(...)");
        assert_eq!(invocations[1].policy_text, "git push --force");
    }

    #[test]
    fn powershell_script_blocks_are_nested_invocations() {
        let invocations = extract_invocations(
            "Get-ChildItem | ForEach-Object { git push --force }",
            ToolKind::PowerShell,
        );
        let policies: Vec<&str> = invocations.iter().map(|i| i.policy_text.as_str()).collect();
        assert_eq!(
            policies,
            vec!["Get-ChildItem", "ForEach-Object {...}", "git push --force"]
        );
    }

    #[test]
    fn powershell_quoting() {
        let invocations = extract_invocations(
            r#"Get-Content -LiteralPath 'C:\it''s here\a.txt' "b $(whoami)""#,
            ToolKind::PowerShell,
        );
        assert_eq!(
            invocations[0].argv,
            vec!["Get-Content", "-LiteralPath", r"C:\it''s here\a.txt", "b $(whoami)"]
        );
        assert_eq!(
            invocations[0].policy_text,
            r"Get-Content -LiteralPath C:\it''s here\a.txt b $(...)"
        );
        assert_eq!(invocations[1].signature, "whoami");
    }

    #[test]
    fn powershell_assignment_and_call_operator() {
        assert_eq!(
            signatures("$files = Get-ChildItem src", ToolKind::PowerShell),
            vec!["Get-ChildItem src"]
        );
        assert_eq!(
            signatures("& 'C:\\tools\\fmt.exe' --check", ToolKind::PowerShell),
            vec![r"C:\tools\fmt.exe"]
        );
    }

    #[test]
    fn powershell_comments_are_ignored() {
        assert_eq!(
            signatures("Get-Date # Remove-Item x", ToolKind::PowerShell),
            vec!["Get-Date"]
        );
    }

    #[test]
    fn unique_signatures_keep_first_seen_order() {
        assert_eq!(
            extract_signatures("git status; git status; ls", ToolKind::PowerShell),
            vec!["git status", "ls"]
        );
    }

    #[test]
    fn builtin_has_no_invocations() {
        assert!(extract_invocations("builtin.read_file\npath: x", ToolKind::Builtin).is_empty());
    }
}
