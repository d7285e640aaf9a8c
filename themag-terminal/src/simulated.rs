use crate::surface::Surface;
use crate::vfs::{self, FileNode};

/// Command interpreter over an in-memory workspace. Nothing here touches the
/// host system.
pub struct SimulatedShell {
    tree: Vec<FileNode>,
    cwd: String,
}

impl SimulatedShell {
    pub fn new(tree: Vec<FileNode>) -> Self {
        Self {
            tree,
            cwd: "/".to_string(),
        }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn execute(&mut self, line: &str, out: &dyn Surface) {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return;
        };
        let command = command.to_lowercase();
        let args: Vec<&str> = parts.collect();

        match command.as_str() {
            "help" => help(out),
            "ls" => self.ls(args.first().copied(), out),
            "cd" => self.cd(args.first().copied(), out),
            "pwd" => out.writeln(&format!("\r\n{}", self.cwd)),
            "cat" => self.cat(args.first().copied(), out),
            "echo" => out.writeln(&format!("\r\n{}", args.join(" "))),
            "clear" => out.clear(),
            "npm" => npm(&args, out),
            "git" => git(&args, out),
            "node" => node(args.first().copied(), out),
            other => {
                out.writeln(&format!("\r\n\x1b[31mCommand not found: {other}\x1b[0m"));
                out.writeln("\x1b[90mType \"help\" for available commands\x1b[0m");
            }
        }
    }

    fn lookup(&self, path: &str) -> Option<&FileNode> {
        vfs::find(&self.tree, &vfs::resolve(&self.cwd, path))
    }

    fn ls(&self, target: Option<&str>, out: &dyn Surface) {
        let entries: &[FileNode] = match target {
            None if self.cwd == "/" => &self.tree,
            None => self
                .lookup(&self.cwd)
                .map(|node| node.children.as_slice())
                .unwrap_or_default(),
            Some("/") => &self.tree,
            Some(path) => self
                .lookup(path)
                .map(|node| node.children.as_slice())
                .unwrap_or_default(),
        };

        if entries.is_empty() {
            out.writeln("\r\n\x1b[90m(empty directory)\x1b[0m");
            return;
        }
        out.writeln("");
        for entry in entries {
            if entry.is_folder() {
                out.write(&format!("\x1b[1;34m{}/\x1b[0m  ", entry.name));
            } else {
                let color = match entry.name.rsplit('.').next() {
                    Some("ts" | "tsx") => "33",
                    Some("json") => "32",
                    _ => "37",
                };
                out.write(&format!("\x1b[{color}m{}\x1b[0m  ", entry.name));
            }
        }
        out.writeln("");
    }

    fn cd(&mut self, target: Option<&str>, out: &dyn Surface) {
        let target = match target {
            None | Some("~") | Some("/") => {
                self.cwd = "/".to_string();
                return;
            }
            Some(target) => target,
        };
        let next = vfs::resolve(&self.cwd, target);
        if next == "/" {
            self.cwd = next;
            return;
        }
        match vfs::find(&self.tree, &next) {
            Some(node) if node.is_folder() => self.cwd = next,
            _ => out.writeln(&format!("\r\n\x1b[31mcd: {target}: No such directory\x1b[0m")),
        }
    }

    fn cat(&self, target: Option<&str>, out: &dyn Surface) {
        let Some(target) = target else {
            out.writeln("\r\n\x1b[31mcat: missing operand\x1b[0m");
            return;
        };
        match self.lookup(target) {
            Some(FileNode {
                content: Some(content),
                ..
            }) if !content.is_empty() => {
                out.writeln("");
                for line in content.split('\n') {
                    out.writeln(line);
                }
            }
            _ => out.writeln(&format!("\r\n\x1b[31mcat: {target}: No such file\x1b[0m")),
        }
    }
}

fn help(out: &dyn Surface) {
    out.writeln("\r\n\x1b[1;36mAvailable Commands:\x1b[0m");
    for (name, usage, about) in [
        ("ls", " [path]", "List directory contents"),
        ("cd", " <path>", "Change directory"),
        ("pwd", "", "Print working directory"),
        ("cat", " <file>", "Display file contents"),
        ("echo", " <text>", "Print text"),
        ("clear", "", "Clear terminal"),
        ("npm", " <cmd>", "Simulate npm commands"),
        ("git", " <cmd>", "Simulate git commands"),
        ("node", " <file>", "Simulate Node.js execution"),
        ("help", "", "Show this help"),
    ] {
        let pad = 15usize.saturating_sub(name.len() + usage.len());
        out.writeln(&format!(
            "  \x1b[33m{name}\x1b[0m{usage}{:pad$}- {about}",
            ""
        ));
    }
}

fn npm(args: &[&str], out: &dyn Surface) {
    match args {
        ["run", "dev", ..] => {
            out.writeln("\r\n\x1b[1;37m> themag-framework@2.1.0 dev\x1b[0m");
            out.writeln("\x1b[1;37m> vite\x1b[0m");
            out.writeln("");
            out.writeln("\x1b[1;32m  VITE v5.0.0\x1b[0m  ready in \x1b[1;33m127ms\x1b[0m");
            out.writeln("");
            out.writeln(
                "  \x1b[36m➜\x1b[0m  \x1b[1mLocal:\x1b[0m   \x1b[36mhttp://localhost:5173/\x1b[0m",
            );
            out.writeln("  \x1b[90m➜\x1b[0m  \x1b[90mNetwork: use --host to expose\x1b[0m");
        }
        ["install", ..] | ["i", ..] => {
            out.writeln("\r\n\x1b[90madded 247 packages in 3.2s\x1b[0m");
            out.writeln("\x1b[90m43 packages are looking for funding\x1b[0m");
            out.writeln("  run `npm fund` for details");
        }
        ["test", ..] => {
            out.writeln("\r\n\x1b[1;32m✓\x1b[0m 24 tests passed");
            out.writeln("\x1b[1;33m○\x1b[0m 2 tests skipped");
            out.writeln("\x1b[90mRan all test suites in 1.42s\x1b[0m");
        }
        _ => out.writeln(&format!("\r\n\x1b[90mnpm {}\x1b[0m", args.join(" "))),
    }
}

fn git(args: &[&str], out: &dyn Surface) {
    match args.first().copied() {
        Some("status") => {
            out.writeln("\r\nOn branch \x1b[32mmain\x1b[0m");
            out.writeln("Your branch is up to date with \x1b[31morigin/main\x1b[0m.");
            out.writeln("");
            out.writeln("Changes not staged for commit:");
            out.writeln("  \x1b[31mmodified:   src/components/App.tsx\x1b[0m");
            out.writeln("  \x1b[31mmodified:   src/hooks/useAuth.ts\x1b[0m");
        }
        Some("branch") => {
            out.writeln("\r\n* \x1b[32mmain\x1b[0m");
            out.writeln("  feature/auth-provider");
            out.writeln("  hotfix/v1.0.2-patch");
        }
        Some("log") => {
            out.writeln("\r\n\x1b[33mcommit abc123def456\x1b[0m (HEAD -> main)");
            out.writeln("Author: Developer <dev@themag.dev>");
            out.writeln("Date:   Today");
            out.writeln("");
            out.writeln("    feat: add authentication hooks");
        }
        _ => out.writeln(&format!("\r\n\x1b[90mgit {}\x1b[0m", args.join(" "))),
    }
}

fn node(script: Option<&str>, out: &dyn Surface) {
    match script {
        Some(script) => {
            out.writeln(&format!("\r\n\x1b[90mExecuting {script}...\x1b[0m"));
            out.writeln("\x1b[32mScript completed successfully\x1b[0m");
        }
        None => {
            out.writeln("\r\nWelcome to Node.js v20.0.0.");
            out.writeln("Type \".help\" for more information.");
        }
    }
}
