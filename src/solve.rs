use std::collections::VecDeque;

use crate::env::Environment;
use crate::prelude::*;
use crate::recipe::Recipe;

/// Anything the solver can schedule: a recipe to build, a binary package
/// available from a repository, or a package already installed in the
/// target environment (which participates in ordering but is normally
/// omitted from results).
#[derive(Debug, Clone)]
pub enum Resolvable {
    Recipe(Rc<Recipe>),
    Package(Rc<PackageMeta>),
    Installed(Rc<PackageMeta>),
}

impl Resolvable {
    pub fn name(&self) -> &PackageName {
        match self {
            Resolvable::Recipe(r) => &r.name,
            Resolvable::Package(p) | Resolvable::Installed(p) => &p.name,
        }
    }

    pub fn version(&self) -> &Version {
        match self {
            Resolvable::Recipe(r) => &r.version,
            Resolvable::Package(p) | Resolvable::Installed(p) => &p.version,
        }
    }

    pub fn revision(&self) -> &Revision {
        match self {
            Resolvable::Recipe(r) => &r.revision,
            Resolvable::Package(p) | Resolvable::Installed(p) => &p.revision,
        }
    }

    pub fn platform(&self) -> &Platform {
        match self {
            Resolvable::Recipe(r) => &r.platform,
            Resolvable::Package(p) | Resolvable::Installed(p) => &p.platform,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        match self {
            Resolvable::Recipe(r) => &r.dependencies,
            Resolvable::Package(p) | Resolvable::Installed(p) => &p.dependencies,
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, Resolvable::Installed(_))
    }

    pub fn requirements(&self, platform: &Platform) -> Result<Vec<Requirement>> {
        self.dependencies()
            .iter()
            .map(|dep| Requirement::parse(dep, platform))
            .collect()
    }

    fn kind(&self) -> &'static str {
        match self {
            Resolvable::Recipe(_) => "recipe",
            Resolvable::Package(_) => "package",
            Resolvable::Installed(_) => "installed",
        }
    }

    pub fn identity(&self) -> String {
        format!(
            "{}:{}-{}-{}-{}",
            self.kind(),
            self.name().normalized(),
            self.version(),
            self.revision(),
            self.platform()
        )
    }
}

impl Candidate for Resolvable {
    fn name(&self) -> &PackageName {
        Resolvable::name(self)
    }

    fn version(&self) -> &Version {
        Resolvable::version(self)
    }

    fn platform(&self) -> &Platform {
        Resolvable::platform(self)
    }
}

impl Display for Resolvable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name(), self.version())
    }
}

/// Where satisfiers come from: package and recipe repositories implement
/// this and can be mixed freely in one solve.
pub trait Repository {
    fn find_objects(&self, requirement: &Requirement) -> Vec<Resolvable>;
}

pub type NodeId = usize;

/// A node of the dependency graph. All cross-references are arena indices
/// into `Solver::nodes`.
#[derive(Debug)]
pub struct Node {
    pub obj: Resolvable,
    /// requirement -> satisfier nodes attached to this requester
    requirements: IndexMap<Requirement, BTreeSet<NodeId>>,
    /// nodes that depend on this one
    dependents: BTreeSet<NodeId>,
}

/// The per-name requirement record: the merge of everything requested so
/// far, who requested what, and which nodes satisfy the merge.
#[derive(Debug)]
struct SolverRequirement {
    merged: Requirement,
    requesters: IndexMap<NodeId, Requirement>,
    satisfiers: BTreeSet<NodeId>,
}

/// Pick one satisfier among several. The default prefers the highest
/// `(version, revision)`.
pub type Selector = fn(&Solver, &BTreeSet<NodeId>) -> NodeId;

pub fn select_most_recent(solver: &Solver, candidates: &BTreeSet<NodeId>) -> NodeId {
    *candidates
        .iter()
        .max_by(|a, b| {
            let a = &solver.nodes[**a].obj;
            let b = &solver.nodes[**b].obj;
            (a.version(), a.revision()).cmp(&(b.version(), b.revision()))
        })
        .expect("selector called with no candidates")
}

pub struct Solver {
    platform: Platform,
    nodes: Vec<Node>,
    requirements: IndexMap<String, SolverRequirement>,
    objects: HashMap<String, NodeId>,
}

impl Solver {
    pub fn new(platform: &Platform) -> Solver {
        Solver {
            platform: platform.clone(),
            nodes: Vec::new(),
            requirements: IndexMap::new(),
            objects: HashMap::new(),
        }
    }

    pub fn contains(&self, obj: &Resolvable) -> bool {
        self.objects.contains_key(&obj.identity())
    }

    /// All merged requirements that currently have no satisfier.
    pub fn unsatisfied(&self) -> Vec<&Requirement> {
        self.requirements
            .values()
            .filter(|record| record.satisfiers.is_empty())
            .map(|record| &record.merged)
            .collect()
    }

    /// Add an object to the graph. Its requirements are merged into the
    /// per-name records; then, if some record wants this object's name, the
    /// new node is attached to every requester whose original requirement
    /// it satisfies.
    pub fn add(&mut self, obj: Resolvable, skip_dependencies: bool) -> Result<NodeId> {
        let identity = obj.identity();
        if self.objects.contains_key(&identity) {
            return Err(IpkgError::DuplicateObject { identity }.into());
        }

        let id = self.nodes.len();
        let mut node_requirements = IndexMap::new();
        if !skip_dependencies {
            for requirement in obj.requirements(&self.platform)? {
                node_requirements.insert(requirement, BTreeSet::new());
            }
        }

        // merge the new node's requirements into the per-name records
        for requirement in node_requirements.keys() {
            let key = requirement.name().normalized().to_owned();
            match self.requirements.get_mut(&key) {
                Some(record) => {
                    record.merged = record.merged.merge(requirement)?;
                    record.requesters.insert(id, requirement.clone());
                    // drop satisfiers that no longer satisfy the merge
                    let merged = record.merged.clone();
                    let nodes = &self.nodes;
                    record
                        .satisfiers
                        .retain(|satisfier| merged.satisfied_by(&nodes[*satisfier].obj));
                }
                None => {
                    let mut requesters = IndexMap::new();
                    requesters.insert(id, requirement.clone());
                    self.requirements.insert(
                        key,
                        SolverRequirement {
                            merged: requirement.clone(),
                            requesters,
                            satisfiers: BTreeSet::new(),
                        },
                    );
                }
            }
        }

        self.nodes.push(Node {
            obj,
            requirements: node_requirements,
            dependents: BTreeSet::new(),
        });
        self.objects.insert(identity, id);

        // try to satisfy existing requesters with this node
        let key = self.nodes[id].obj.name().normalized().to_owned();
        if let Some(record) = self.requirements.get_mut(&key) {
            if record.merged.satisfied_by(&self.nodes[id].obj) {
                record.satisfiers.insert(id);
            }
            let attachments: Vec<(NodeId, Requirement)> = record
                .requesters
                .iter()
                .filter(|(_, original)| original.satisfied_by(&self.nodes[id].obj))
                .map(|(requester, original)| (*requester, original.clone()))
                .collect();
            for (requester, original) in attachments {
                if requester == id {
                    continue;
                }
                self.nodes[requester]
                    .requirements
                    .entry(original)
                    .or_default()
                    .insert(id);
                self.nodes[id].dependents.insert(requester);
                debug!(
                    "requirement of node {requester} satisfied by {}",
                    self.nodes[id].obj
                );
            }
        }

        Ok(id)
    }

    /// Seed a solver from a root object, discovering satisfiers in the
    /// environment's installed packages and then in the given repositories.
    /// Requirements that nothing satisfies are left in place (observable
    /// via `unsatisfied`), not treated as fatal here.
    pub fn from_obj(
        obj: Resolvable,
        platform: &Platform,
        environment: Option<&Environment>,
        repositories: &[&dyn Repository],
    ) -> Result<Solver> {
        let mut solver = Solver::new(platform);
        let root = solver.add(obj, false)?;

        let mut queue: VecDeque<(NodeId, Requirement)> = solver.nodes[root]
            .requirements
            .keys()
            .map(|requirement| (root, requirement.clone()))
            .collect();

        while let Some((requiring, requirement)) = queue.pop_front() {
            trace!("resolving {requirement} for node {requiring}");
            let key = requirement.name().normalized().to_owned();

            if let Some(record) = solver.requirements.get(&key) {
                if !record.satisfiers.is_empty() {
                    // already satisfied in the graph: attach all satisfiers
                    let satisfiers = record.satisfiers.clone();
                    for satisfier in &satisfiers {
                        solver.nodes[*satisfier].dependents.insert(requiring);
                    }
                    solver.nodes[requiring]
                        .requirements
                        .insert(requirement, satisfiers);
                    continue;
                }
            }

            if let Some(environment) = environment {
                if let Some(package) = environment
                    .packages()
                    .find(|package| requirement.satisfied_by(*package))
                {
                    debug!("satisfied by environment package {}", package.spec_string());
                    // its own dependencies are resolved by the environment,
                    // so they are neither recorded nor enqueued
                    solver.add(
                        Resolvable::Installed(Rc::new(package.clone())),
                        true,
                    )?;
                    continue;
                }
            }

            let mut found = 0usize;
            for repository in repositories {
                for satisfier in repository.find_objects(&requirement) {
                    if solver.contains(&satisfier) {
                        continue;
                    }
                    let new_node = solver.add(satisfier, false)?;
                    found += 1;
                    for new_requirement in
                        solver.nodes[new_node].requirements.keys()
                    {
                        queue.push_back((new_node, new_requirement.clone()));
                    }
                }
            }
            if found == 0 {
                debug!("no satisfier found for {requirement}");
            }
        }

        Ok(solver)
    }

    fn node_for(&self, obj: &Resolvable) -> Result<NodeId> {
        self.objects
            .get(&obj.identity())
            .copied()
            .ok_or_else(|| eyre!("unknown solve target: {obj}"))
    }

    /// BFS over the requirements reachable from `target`, picking one
    /// satisfier per requirement name. Fails when a reachable requirement
    /// has no satisfier at all.
    pub fn find_best_dependencies(
        &self,
        target: &Resolvable,
        selector: Selector,
    ) -> Result<Vec<Resolvable>> {
        let target = self.node_for(target)?;
        let mut chosen: IndexMap<String, NodeId> = IndexMap::new();
        let mut queue: VecDeque<(NodeId, Requirement)> = self.nodes[target]
            .requirements
            .keys()
            .map(|requirement| (target, requirement.clone()))
            .collect();

        while let Some((owner, requirement)) = queue.pop_front() {
            let key = requirement.name().normalized().to_owned();
            if chosen.contains_key(&key) {
                continue;
            }
            let not_found = || IpkgError::RequirementNotFound {
                requirement: requirement.to_string(),
                requester: self.nodes[owner].obj.to_string(),
            };
            let record = self.requirements.get(&key).ok_or_else(not_found)?;
            if record.satisfiers.is_empty() {
                return Err(not_found().into());
            }
            let satisfier = selector(self, &record.satisfiers);
            for satisfier_requirement in self.nodes[satisfier].requirements.keys() {
                queue.push_back((satisfier, satisfier_requirement.clone()));
            }
            chosen.insert(key, satisfier);
        }

        Ok(chosen
            .values()
            .map(|id| self.nodes[*id].obj.clone())
            .collect())
    }

    /// Emit a topological install order: dependencies before dependents.
    ///
    /// Starting from the nodes nobody depends on, a node's chosen
    /// dependency becomes ready once every dependent sharing the current
    /// node's name has been accounted for. Residual dependents at the end
    /// mean the graph had a cycle.
    pub fn solve(
        &self,
        target: Option<&Resolvable>,
        selector: Selector,
        ignore_installed: bool,
    ) -> Result<Vec<Resolvable>> {
        let scope: Vec<NodeId> = match target {
            None => (0..self.nodes.len()).collect(),
            Some(target) => {
                let mut scope = vec![self.node_for(target)?];
                for obj in self.find_best_dependencies(target, selector)? {
                    scope.push(self.node_for(&obj)?);
                }
                scope
            }
        };

        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut emitted: HashSet<NodeId> = HashSet::new();
        for id in &scope {
            if self.nodes[*id].dependents.is_empty() {
                queue.push_back(*id);
                emitted.insert(*id);
            }
        }
        if queue.is_empty() {
            return Err(IpkgError::Cycle {
                involving: scope
                    .iter()
                    .map(|id| self.nodes[*id].obj.to_string())
                    .collect(),
            }
            .into());
        }

        let mut sorted: Vec<NodeId> = Vec::new();
        let mut residual_dependents: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();

        while let Some(id) = queue.pop_front() {
            sorted.push(id);
            let name = self.nodes[id].obj.name().clone();

            for requirement in self.nodes[id].requirements.keys() {
                let key = requirement.name().normalized();
                let record = self.requirements.get(key).expect("requirement recorded");
                let dependency = match record.satisfiers.len() {
                    0 => {
                        return Err(IpkgError::RequirementNotFound {
                            requirement: requirement.to_string(),
                            requester: self.nodes[id].obj.to_string(),
                        }
                        .into())
                    }
                    1 => *record.satisfiers.iter().next().unwrap(),
                    _ => selector(self, &record.satisfiers),
                };

                let waiting = residual_dependents
                    .entry(dependency)
                    .or_insert_with(|| self.nodes[dependency].dependents.clone());
                waiting.retain(|dependent| *self.nodes[*dependent].obj.name() != name);

                if waiting.is_empty() && !emitted.contains(&dependency) {
                    emitted.insert(dependency);
                    queue.push_back(dependency);
                }
            }
        }

        let stuck: Vec<String> = residual_dependents
            .iter()
            .filter(|(_, waiting)| !waiting.is_empty())
            .map(|(id, _)| self.nodes[*id].obj.to_string())
            .collect();
        if !stuck.is_empty() {
            return Err(IpkgError::Cycle { involving: stuck }.into());
        }

        Ok(sorted
            .iter()
            .rev()
            .map(|id| &self.nodes[*id].obj)
            .filter(|obj| !(ignore_installed && obj.is_installed()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fetch::FileRef;
    use crate::recipe::InstallSteps;

    fn recipe(name: &str, version: &str, dependencies: &[&str]) -> Resolvable {
        Resolvable::Recipe(Rc::new(Recipe {
            name: name.try_into().unwrap(),
            version: version.try_into().unwrap(),
            revision: Revision::one(),
            platform: ANY_PLATFORM.clone(),
            homepage: None,
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            sources: FileRef::new("file:///dev/null.tar.gz", None),
            patches: vec![],
            configure_args: vec![],
            install: InstallSteps::Default,
            envvars: None,
            build_envvars: None,
        }))
    }

    struct TestRepo {
        objects: Vec<Resolvable>,
    }

    impl TestRepo {
        fn new(objects: Vec<Resolvable>) -> TestRepo {
            TestRepo { objects }
        }
    }

    impl Repository for TestRepo {
        fn find_objects(&self, requirement: &Requirement) -> Vec<Resolvable> {
            let mut hits: Vec<Resolvable> = self
                .objects
                .iter()
                .filter(|obj| requirement.satisfied_by(*obj))
                .cloned()
                .collect();
            hits.sort_by(|a, b| {
                (b.version(), b.revision()).cmp(&(a.version(), a.revision()))
            });
            hits
        }
    }

    fn names_and_versions(objs: &[Resolvable]) -> Vec<(String, String)> {
        objs.iter()
            .map(|o| (o.name().to_string(), o.version().to_string()))
            .collect()
    }

    #[test]
    fn test_add_and_unsatisfied() {
        let mut solver = Solver::new(&ANY_PLATFORM);
        solver.add(recipe("foo-bar", "1.0", &["foo", "bar"]), false).unwrap();
        solver.add(recipe("foo", "1.0", &[]), false).unwrap();
        assert_eq!(solver.unsatisfied().len(), 1);
        assert_eq!(solver.unsatisfied()[0].name().as_given(), "bar");
    }

    #[test]
    fn test_add_duplicate_object() {
        let mut solver = Solver::new(&ANY_PLATFORM);
        solver.add(recipe("foo", "1.0", &[]), false).unwrap();
        let err = solver.add(recipe("foo", "1.0", &[]), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::DuplicateObject { .. })
        ));
    }

    #[test]
    fn test_from_obj_simple() {
        let repo = TestRepo::new(vec![
            recipe("foo", "1.0", &[]),
            recipe("bar", "1.0", &[]),
        ]);
        let root = recipe("foo-bar", "1.0", &["foo", "bar"]);
        let solver =
            Solver::from_obj(root.clone(), &ANY_PLATFORM, None, &[&repo]).unwrap();
        assert!(solver.unsatisfied().is_empty());

        let order = solver
            .solve(Some(&root), select_most_recent, true)
            .unwrap();
        let got = names_and_versions(&order);
        // both foo,bar,foo-bar and bar,foo,foo-bar are valid; ours is
        // deterministic
        assert_eq!(got.len(), 3);
        assert_eq!(got[2].0, "foo-bar");
        assert!(got[..2].iter().any(|(n, _)| n == "foo"));
        assert!(got[..2].iter().any(|(n, _)| n == "bar"));
    }

    #[test]
    fn test_from_obj_unsatisfied() {
        let root = recipe("foo-bar", "1.0", &["foo", "bar"]);
        let solver = Solver::from_obj(root, &ANY_PLATFORM, None, &[]).unwrap();
        assert_eq!(solver.unsatisfied().len(), 2);
    }

    fn numbers_repo() -> TestRepo {
        TestRepo::new(vec![
            recipe("one", "1.0", &["two>1,<2", "three==2.0"]),
            recipe("two", "1.5", &["four < 2.0", "five"]),
            recipe("two", "1.6", &["four < 2.0", "five"]),
            recipe("two", "2.0", &["four < 2.0", "five"]),
            recipe("three", "1.0", &[]),
            recipe("three", "2.0", &[]),
            recipe("four", "1.0", &[]),
            recipe("four", "1.3", &[]),
            recipe("four", "1.8", &[]),
            recipe("four", "2.0", &[]),
            recipe("five", "1.0", &["four > 1.0"]),
        ])
    }

    #[test]
    fn test_find_best_dependencies() {
        let repo = numbers_repo();
        let one = recipe("one", "1.0", &["two>1,<2", "three==2.0"]);
        let solver =
            Solver::from_obj(one.clone(), &ANY_PLATFORM, None, &[&repo]).unwrap();
        let best = solver
            .find_best_dependencies(&one, select_most_recent)
            .unwrap();
        assert_eq!(
            names_and_versions(&best),
            vec![
                ("two".into(), "1.6".into()),
                ("three".into(), "2.0".into()),
                ("four".into(), "1.8".into()),
                ("five".into(), "1.0".into()),
            ]
        );
    }

    #[test]
    fn test_solve_numbers() {
        let repo = numbers_repo();
        let one = recipe("one", "1.0", &["two>1,<2", "three==2.0"]);
        let solver =
            Solver::from_obj(one.clone(), &ANY_PLATFORM, None, &[&repo]).unwrap();
        let order = solver.solve(Some(&one), select_most_recent, true).unwrap();
        assert_eq!(
            names_and_versions(&order),
            vec![
                ("four".into(), "1.8".into()),
                ("five".into(), "1.0".into()),
                ("three".into(), "2.0".into()),
                ("two".into(), "1.6".into()),
                ("one".into(), "1.0".into()),
            ]
        );
    }

    #[test]
    fn test_solve_ordering_invariant() {
        // for every (a, b) where b depends on a, a comes first
        let repo = numbers_repo();
        let one = recipe("one", "1.0", &["two>1,<2", "three==2.0"]);
        let solver =
            Solver::from_obj(one.clone(), &ANY_PLATFORM, None, &[&repo]).unwrap();
        let order = solver.solve(Some(&one), select_most_recent, true).unwrap();
        let position = |name: &str| {
            order
                .iter()
                .position(|o| o.name().as_given() == name)
                .unwrap()
        };
        for (dependency, dependent) in [
            ("two", "one"),
            ("three", "one"),
            ("four", "two"),
            ("five", "two"),
            ("four", "five"),
        ] {
            assert!(
                position(dependency) < position(dependent),
                "{dependency} should come before {dependent}"
            );
        }
    }

    #[test]
    fn test_solve_cycle() {
        let repo = TestRepo::new(vec![
            recipe("loop-b", "1.0", &["loop-c"]),
            recipe("loop-c", "1.0", &["loop-b"]),
        ]);
        let loop_a = recipe("loop-a", "1.0", &["loop-b", "loop-c"]);
        let solver =
            Solver::from_obj(loop_a.clone(), &ANY_PLATFORM, None, &[&repo]).unwrap();
        let err = solver
            .solve(Some(&loop_a), select_most_recent, true)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::Cycle { .. })
        ));
    }

    #[test]
    fn test_cycle_outside_closure_is_harmless() {
        // the loop-b/loop-c cycle exists in the graph, but the solve target
        // doesn't reach it
        let mut solver = Solver::new(&ANY_PLATFORM);
        let root = recipe("standalone", "1.0", &[]);
        solver.add(root.clone(), false).unwrap();
        solver.add(recipe("loop-b", "1.0", &["loop-c"]), false).unwrap();
        solver.add(recipe("loop-c", "1.0", &["loop-b"]), false).unwrap();
        let order = solver.solve(Some(&root), select_most_recent, true).unwrap();
        assert_eq!(names_and_versions(&order), vec![("standalone".into(), "1.0".into())]);
    }

    #[test]
    fn test_solver_soundness() {
        // every result element is the target or in its transitive closure
        let repo = numbers_repo();
        let one = recipe("one", "1.0", &["two>1,<2", "three==2.0"]);
        let solver =
            Solver::from_obj(one.clone(), &ANY_PLATFORM, None, &[&repo]).unwrap();
        let order = solver.solve(Some(&one), select_most_recent, true).unwrap();
        let reachable: HashSet<&str> =
            ["one", "two", "three", "four", "five"].into();
        for obj in &order {
            assert!(reachable.contains(obj.name().as_given()));
        }
    }

    #[test]
    fn test_constraint_merge_narrows_satisfiers() {
        // "four" alone would pick 2.0, but five's "four > 1.0" merged with
        // two's "four < 2.0" narrows the record to 1.8
        let repo = numbers_repo();
        let root = recipe("root", "1.0", &["two==1.6"]);
        let solver =
            Solver::from_obj(root.clone(), &ANY_PLATFORM, None, &[&repo]).unwrap();
        let best = solver
            .find_best_dependencies(&root, select_most_recent)
            .unwrap();
        let four = best
            .iter()
            .find(|o| o.name().as_given() == "four")
            .unwrap();
        assert_eq!(four.version().to_string(), "1.8");
    }

    #[test]
    fn test_requirement_not_found() {
        let repo = TestRepo::new(vec![recipe("two", "3.0", &[])]);
        let root = recipe("root", "1.0", &["two>1,<2"]);
        let solver =
            Solver::from_obj(root.clone(), &ANY_PLATFORM, None, &[&repo]).unwrap();
        assert_eq!(solver.unsatisfied().len(), 1);
        let err = solver
            .find_best_dependencies(&root, select_most_recent)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::RequirementNotFound { .. })
        ));
    }
}
