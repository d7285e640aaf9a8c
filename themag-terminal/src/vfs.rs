use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// One entry of the in-memory workspace tree. Paths are absolute and use `/`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

impl FileNode {
    pub fn file(path: &str, content: &str) -> Self {
        Self {
            name: base_name(path).to_string(),
            path: path.to_string(),
            kind: NodeKind::File,
            content: Some(content.to_string()),
            children: Vec::new(),
        }
    }

    pub fn folder(path: &str, children: Vec<FileNode>) -> Self {
        Self {
            name: base_name(path).to_string(),
            path: path.to_string(),
            kind: NodeKind::Folder,
            content: None,
            children,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').find(|part| !part.is_empty()).unwrap_or("/")
}

/// Depth-first lookup by absolute path.
pub fn find<'a>(nodes: &'a [FileNode], path: &str) -> Option<&'a FileNode> {
    for node in nodes {
        if node.path == path {
            return Some(node);
        }
        if let Some(found) = find(&node.children, path) {
            return Some(found);
        }
    }
    None
}

/// Resolves `target` against `cwd` into a normalized absolute path.
/// `..` never climbs above `/`.
pub fn resolve(cwd: &str, target: &str) -> String {
    let joined = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("{cwd}/{target}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Workspace shown when no tree is supplied.
pub fn sample_workspace() -> Vec<FileNode> {
    vec![
        FileNode::folder(
            "/src",
            vec![
                FileNode::folder(
                    "/src/components",
                    vec![
                        FileNode::file(
                            "/src/components/App.tsx",
                            "import React from 'react';\n\nexport const App: React.FC = () => {\n  return <main className=\"min-h-screen\" />;\n};\n\nexport default App;",
                        ),
                        FileNode::file(
                            "/src/components/Button.tsx",
                            "import React from 'react';\n\nexport const Button: React.FC<{ label: string }> = ({ label }) => (\n  <button>{label}</button>\n);",
                        ),
                    ],
                ),
                FileNode::folder(
                    "/src/hooks",
                    vec![FileNode::file(
                        "/src/hooks/useAuth.ts",
                        "export const useAuth = () => {\n  return { user: null, login: async () => {}, logout: () => {} };\n};",
                    )],
                ),
                FileNode::file(
                    "/src/main.tsx",
                    "import React from 'react';\nimport ReactDOM from 'react-dom/client';\nimport App from './components/App';\n\nReactDOM.createRoot(document.getElementById('root')!).render(<App />);",
                ),
                FileNode::file(
                    "/src/index.css",
                    "@tailwind base;\n@tailwind components;\n@tailwind utilities;",
                ),
            ],
        ),
        FileNode::folder(
            "/public",
            vec![FileNode::file(
                "/public/index.html",
                "<!doctype html>\n<html>\n  <body>\n    <div id=\"root\"></div>\n  </body>\n</html>",
            )],
        ),
        FileNode::file(
            "/package.json",
            "{\n  \"name\": \"themag-framework\",\n  \"version\": \"2.1.0\",\n  \"scripts\": {\n    \"dev\": \"vite\",\n    \"build\": \"tsc && vite build\"\n  }\n}",
        ),
        FileNode::file(
            "/README.md",
            "# TheMAG Framework\n\nA starter workspace for TheMAG.dev projects.",
        ),
        FileNode::file(
            "/tsconfig.json",
            "{\n  \"compilerOptions\": {\n    \"target\": \"ES2020\",\n    \"jsx\": \"react-jsx\",\n    \"strict\": true\n  }\n}",
        ),
    ]
}
