//! Service dependency graph.

use std::collections::{BTreeMap, BTreeSet};

use cdbox_core::error::{BoxError, Result};

use super::model::Service;

/// `depends_on` edges of a project: service -> the services it needs.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl Graph {
    /// Build the graph; every dependency must name a declared service.
    pub fn new(services: &BTreeMap<String, Service>) -> Result<Self> {
        let mut deps = BTreeMap::new();
        for (name, svc) in services {
            let mut needs = BTreeSet::new();
            for (dep, _) in svc.dependencies() {
                if !services.contains_key(&dep) {
                    return Err(BoxError::invalid(format!(
                        "service {name} depends on undefined service {dep}"
                    )));
                }
                if dep == *name {
                    return Err(BoxError::invalid(format!("service {name} depends on itself")));
                }
                needs.insert(dep);
            }
            deps.insert(name.clone(), needs);
        }
        Ok(Self { deps })
    }

    pub fn dependencies(&self, service: &str) -> impl Iterator<Item = &String> {
        self.deps.get(service).into_iter().flatten()
    }

    /// Topological order; ties break alphabetically so the order is stable.
    pub fn order(&self) -> Result<Vec<String>> {
        let mut pending: BTreeMap<&str, usize> =
            self.deps.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut out = Vec::with_capacity(self.deps.len());
        while let Some(next) = ready.pop_first() {
            pending.remove(next);
            out.push(next.to_string());
            for (name, needs) in &self.deps {
                if needs.contains(next) {
                    if let Some(n) = pending.get_mut(name.as_str()) {
                        *n -= 1;
                        if *n == 0 {
                            ready.insert(name.as_str());
                        }
                    }
                }
            }
        }
        if !pending.is_empty() {
            let cycle: Vec<&str> = pending.keys().copied().collect();
            return Err(BoxError::invalid(format!(
                "dependency cycle detected between services: {}",
                cycle.join(", ")
            )));
        }
        Ok(out)
    }

    /// `services` plus everything they transitively depend on.
    pub fn closure(&self, services: &[String]) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = services.to_vec();
        while let Some(s) = stack.pop() {
            if seen.insert(s.clone()) {
                stack.extend(self.dependencies(&s).cloned());
            }
        }
        seen
    }

    /// Group `selected` into batches that can start together: each batch
    /// only depends on earlier ones.
    pub fn levels(&self, selected: &BTreeSet<String>) -> Result<Vec<Vec<String>>> {
        let mut level: BTreeMap<String, usize> = BTreeMap::new();
        for name in self.order()? {
            if !selected.contains(&name) {
                continue;
            }
            let depth = self
                .dependencies(&name)
                .filter_map(|d| level.get(d))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(name, depth);
        }
        let mut out: Vec<Vec<String>> = Vec::new();
        for (name, depth) in level {
            if out.len() <= depth {
                out.resize(depth + 1, Vec::new());
            }
            out[depth].push(name);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::model::DependsOn;

    fn services(edges: &[(&str, &[&str])]) -> BTreeMap<String, Service> {
        edges
            .iter()
            .map(|(name, deps)| {
                let svc = Service {
                    image: Some("alpine".into()),
                    depends_on: (!deps.is_empty())
                        .then(|| DependsOn::List(deps.iter().map(|d| d.to_string()).collect())),
                    ..Service::default()
                };
                (name.to_string(), svc)
            })
            .collect()
    }

    #[test]
    fn test_order_and_levels() {
        let g = Graph::new(&services(&[
            ("web", &["api"]),
            ("api", &["db", "cache"]),
            ("db", &[]),
            ("cache", &[]),
            ("worker", &["db"]),
        ]))
        .unwrap();
        assert_eq!(g.order().unwrap(), vec!["cache", "db", "api", "web", "worker"]);

        let all: BTreeSet<String> = g.closure(&["web".into(), "worker".into()]);
        assert_eq!(all.len(), 5);
        assert_eq!(
            g.levels(&all).unwrap(),
            vec![
                vec!["cache".to_string(), "db".to_string()],
                vec!["api".to_string(), "worker".to_string()],
                vec!["web".to_string()],
            ]
        );

        let api_only = g.closure(&["api".into()]);
        assert_eq!(api_only.into_iter().collect::<Vec<_>>(), vec!["api", "cache", "db"]);
    }

    #[test]
    fn test_rejects_bad_edges() {
        let cycle = Graph::new(&services(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])])).unwrap();
        let err = cycle.order().unwrap_err().to_string();
        assert!(err.contains("a, b, c"), "{err}");

        assert!(Graph::new(&services(&[("a", &["ghost"])])).is_err());
        assert!(Graph::new(&services(&[("a", &["a"])])).is_err());
    }
}
