use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::Context;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::engine::models::{Language, ProblemId, TestCase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: ProblemId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Starter code per language. An empty map offers every language.
    #[serde(default)]
    pub boilerplate: HashMap<Language, String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// Read-only view of problem data owned by another service.
pub trait ProblemCatalog: Send + Sync {
    fn test_cases(&self, id: &ProblemId) -> Option<Vec<TestCase>>;

    fn languages(&self, id: &ProblemId) -> Option<Vec<Language>>;

    fn boilerplate(&self, id: &ProblemId) -> Option<HashMap<Language, String>>;
}

#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    problems: Arc<DashMap<ProblemId, Problem>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_problems(problems: impl IntoIterator<Item = Problem>) -> Self {
        let catalog = Self::new();
        for problem in problems {
            catalog.insert(problem);
        }
        catalog
    }

    /// Loads a JSON array of problems.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read problem catalog {}", path.display()))?;
        let problems: Vec<Problem> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse problem catalog {}", path.display()))?;
        Ok(Self::with_problems(problems))
    }

    pub fn seeded() -> Self {
        Self::with_problems([two_sum()])
    }

    pub fn insert(&self, problem: Problem) {
        self.problems.insert(problem.id.clone(), problem);
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }
}

impl ProblemCatalog for InMemoryCatalog {
    fn test_cases(&self, id: &ProblemId) -> Option<Vec<TestCase>> {
        self.problems.get(id).map(|p| p.test_cases.clone())
    }

    fn languages(&self, id: &ProblemId) -> Option<Vec<Language>> {
        self.problems.get(id).map(|p| {
            if p.boilerplate.is_empty() {
                return Language::ALL.to_vec();
            }
            Language::ALL
                .into_iter()
                .filter(|language| p.boilerplate.contains_key(language))
                .collect()
        })
    }

    fn boilerplate(&self, id: &ProblemId) -> Option<HashMap<Language, String>> {
        self.problems.get(id).map(|p| p.boilerplate.clone())
    }
}

fn two_sum() -> Problem {
    let boilerplate = HashMap::from([
        (
            Language::Python,
            "import json\nimport sys\n\n\ndef two_sum(nums, target):\n    pass\n\n\ndata = json.loads(sys.stdin.read())\nprint(json.dumps(two_sum(data[\"nums\"], data[\"target\"])).replace(\",\", \", \"))\n"
                .to_string(),
        ),
        (
            Language::JavaScript,
            "const data = JSON.parse(require('fs').readFileSync(0, 'utf8'));\n\nfunction twoSum(nums, target) {\n}\n\nconsole.log(JSON.stringify(twoSum(data.nums, data.target)).replace(/,/g, ', '));\n"
                .to_string(),
        ),
        (
            Language::Java,
            "import java.util.*;\n\npublic class Main {\n    static int[] twoSum(int[] nums, int target) {\n        return new int[0];\n    }\n\n    public static void main(String[] args) {\n        String in = new Scanner(System.in).useDelimiter(\"\\\\A\").next();\n    }\n}\n"
                .to_string(),
        ),
        (
            Language::Cpp,
            "#include <bits/stdc++.h>\nusing namespace std;\n\nvector<int> twoSum(vector<int>& nums, int target) {\n    return {};\n}\n\nint main() {\n    string in((istreambuf_iterator<char>(cin)), istreambuf_iterator<char>());\n}\n"
                .to_string(),
        ),
    ]);
    Problem {
        id: ProblemId("1".to_string()),
        title: "Two Sum".to_string(),
        description: "Given an array of integers `nums` and an integer `target`, return indices of the two numbers such that they add up to `target`.".to_string(),
        difficulty: Difficulty::Easy,
        boilerplate,
        test_cases: vec![TestCase {
            input: "{\"nums\": [2, 7, 11, 15], \"target\": 9}".to_string(),
            expected_output: "[0, 1]".to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryCatalog, ProblemCatalog};
    use crate::engine::models::{Language, ProblemId};

    #[test]
    fn seeded_catalog_offers_two_sum() {
        let catalog = InMemoryCatalog::seeded();
        let id = ProblemId("1".to_string());
        let cases = catalog.test_cases(&id).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].expected_output, "[0, 1]");
        let languages = catalog.languages(&id).unwrap();
        assert!(languages.contains(&Language::Python));
        assert!(!languages.contains(&Language::Bash));
        assert!(catalog.test_cases(&ProblemId("404".to_string())).is_none());
    }

    #[tokio::test]
    async fn loads_problems_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("problems.json");
        std::fs::write(
            &path,
            r#"[{"id": 7, "title": "Echo", "testCases": [{"input": "hi", "expectedOutput": "hi"}]}]"#,
        )
        .unwrap();
        let catalog = InMemoryCatalog::load(&path).await.unwrap();
        assert_eq!(catalog.len(), 1);
        let id = ProblemId("7".to_string());
        assert_eq!(catalog.test_cases(&id).unwrap()[0].input, "hi");
        assert_eq!(catalog.languages(&id).unwrap().len(), Language::ALL.len());
    }

    #[tokio::test]
    async fn malformed_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("problems.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(InMemoryCatalog::load(&path).await.is_err());
    }
}
