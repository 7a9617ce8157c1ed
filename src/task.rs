use core::fmt;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::patch::{Patch, PatchId};
use crate::variable::{Element, Field, FieldView, FieldViewMut, VarLabel};
use crate::warehouse::{DataWarehouse, Generation};




/// A declared read of a variable, from one generation, including `ghost`
/// layers of data owned by neighboring patches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub label: VarLabel,
    pub generation: Generation,
    pub ghost: i64,
}

/// The variables a task reads, creates and updates. Every access a task
/// makes at run time must be declared here; the task graph is derived from
/// these lists alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Access {
    pub requires: Vec<Requirement>,
    pub computes: Vec<VarLabel>,
    pub modifies: Vec<VarLabel>,
}

impl Access {
    pub fn requires(&mut self, label: &VarLabel, generation: Generation, ghost: i64) -> &mut Self {
        self.requires.push(Requirement { label: label.clone(), generation, ghost });
        self
    }

    pub fn computes(&mut self, label: &VarLabel) -> &mut Self {
        self.computes.push(label.clone());
        self
    }

    pub fn modifies(&mut self, label: &VarLabel) -> &mut Self {
        self.modifies.push(label.clone());
        self
    }

    pub fn extend(&mut self, other: Access) {
        self.requires.extend(other.requires);
        self.computes.extend(other.computes);
        self.modifies.extend(other.modifies);
    }

    pub fn is_empty(&self) -> bool {
        self.requires.is_empty() && self.computes.is_empty() && self.modifies.is_empty()
    }

    /// Whether a read of `name` from `generation` is allowed. Entries a task
    /// creates or updates may always be read back from "new".
    pub fn reads(&self, name: &str, generation: Generation) -> bool {
        self.requires.iter().any(|r| r.label.name == name && r.generation == generation)
            || (generation == Generation::New && self.writes(name))
    }

    pub fn computes_name(&self, name: &str) -> bool {
        self.computes.iter().any(|l| l.name == name)
    }

    pub fn writes(&self, name: &str) -> bool {
        self.computes_name(name) || self.modifies.iter().any(|l| l.name == name)
    }
}




/// The capability every physics task implements: declare what it touches,
/// then run against one patch at a time.
pub trait Kernel: Send + Sync {
    fn declare_access(&self, access: &mut Access);

    fn run(&self, ctx: &mut TaskContext<'_>) -> Result<()>;
}

struct FnKernel<D, R> {
    declare: D,
    run: R,
}

impl<D, R> Kernel for FnKernel<D, R>
where
    D: Fn(&mut Access) + Send + Sync,
    R: Fn(&mut TaskContext<'_>) -> Result<()> + Send + Sync,
{
    fn declare_access(&self, access: &mut Access) {
        (self.declare)(access)
    }

    fn run(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        (self.run)(ctx)
    }
}

/// Build a kernel from a pair of closures.
pub fn kernel_fn<D, R>(declare: D, run: R) -> Box<dyn Kernel>
where
    D: Fn(&mut Access) + Send + Sync + 'static,
    R: Fn(&mut TaskContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    Box::new(FnKernel { declare, run })
}




/// A kernel bound to the patches and materials it runs over. Tasks are
/// created once per step and are immutable once the task graph is built.
pub struct Task {
    name: String,
    patches: Vec<PatchId>,
    materials: Vec<usize>,
    access: Access,
    kernel: Box<dyn Kernel>,
}

impl Task {
    pub fn new(name: &str, kernel: Box<dyn Kernel>, patches: Vec<PatchId>, materials: Vec<usize>) -> Self {
        let mut access = Access::default();
        kernel.declare_access(&mut access);
        Self {
            name: name.to_string(),
            patches,
            materials,
            access,
            kernel,
        }
    }

    /// Add accesses declared from outside the kernel, e.g. by the problem
    /// configuration.
    pub fn with_access(mut self, access: Access) -> Self {
        self.access.extend(access);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patches(&self) -> &[PatchId] {
        &self.patches
    }

    pub fn materials(&self) -> &[usize] {
        &self.materials
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    pub(crate) fn run(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.kernel.run(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Task")
            .field("name", &self.name)
            .field("patches", &self.patches)
            .field("materials", &self.materials)
            .field("access", &self.access)
            .finish()
    }
}




/// What the problem-specification loader hands over for each task: a name,
/// the kind of kernel to construct, where it runs, and any accesses it
/// declares on top of the kernel's own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub kind: String,
    pub patches: Vec<PatchId>,
    pub materials: Vec<usize>,
    #[serde(default)]
    pub access: Access,
}




/// The view of the data warehouse given to a kernel while it runs on one
/// patch. Only entries the task declared are reachable; anything else is
/// reported as `VariableNotFound`.
pub struct TaskContext<'a> {
    dw: &'a mut DataWarehouse,
    task: &'a Task,
    patch: &'a Patch,
    halo: &'a BTreeMap<String, i64>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(dw: &'a mut DataWarehouse, task: &'a Task, patch: &'a Patch, halo: &'a BTreeMap<String, i64>) -> Self {
        Self { dw, task, patch, halo }
    }

    pub fn patch(&self) -> &Patch {
        self.patch
    }

    pub fn materials(&self) -> &[usize] {
        self.task.materials()
    }

    pub fn step(&self) -> u64 {
        self.dw.step()
    }

    /// Read an entry on this patch. Ghost layers filled by the scheduler are
    /// part of the returned view.
    pub fn get<T: Element>(&self, label: &VarLabel, material: usize, generation: Generation) -> Result<FieldView<'_, T>> {
        if !self.task.access.reads(&label.name, generation) {
            return Err(self.undeclared(label, material, generation))
        }
        self.check_material(label, material, generation)?;
        self.dw.get(label, self.patch.id(), material, generation)
    }

    /// Create a zeroed field for a declared `computes`, sized for this patch
    /// and padded by the widest ghost layer any task requires of it.
    pub fn allocate<T: Element>(&self, label: &VarLabel, material: usize) -> Result<Field> {
        if !self.task.access.computes_name(&label.name) {
            return Err(self.undeclared(label, material, Generation::New))
        }
        if T::KIND != label.kind {
            return Err(Error::TypeMismatch {
                name: label.name.clone(),
                expected: VarLabel::describe(label.kind, label.staggering),
                found: VarLabel::describe(T::KIND, label.staggering),
            })
        }
        let ghost = self.halo.get(&label.name).copied().unwrap_or(0);

        match label.staggering.logical_space(self.patch.index_space()) {
            Some(logical) => Ok(Field::zeros::<T>(label.staggering, logical, ghost)),
            None => Ok(Field::particles::<T>(Vec::new())),
        }
    }

    /// Store a declared `computes` for this patch.
    pub fn put(&mut self, label: &VarLabel, material: usize, field: Field) -> Result<()> {
        if !self.task.access.computes_name(&label.name) {
            return Err(self.undeclared(label, material, Generation::New))
        }
        self.check_material(label, material, Generation::New)?;
        self.dw.put(label, self.patch.id(), material, field)
    }

    /// Update an entry this task computes or declared it modifies.
    pub fn modify<T: Element>(&mut self, label: &VarLabel, material: usize) -> Result<FieldViewMut<'_, T>> {
        if !self.task.access.writes(&label.name) {
            return Err(self.undeclared(label, material, Generation::New))
        }
        self.check_material(label, material, Generation::New)?;
        let patch = self.patch.id();
        self.dw.modify(label, patch, material)
    }

    fn check_material(&self, label: &VarLabel, material: usize, generation: Generation) -> Result<()> {
        if self.task.materials.contains(&material) {
            Ok(())
        } else {
            Err(self.undeclared(label, material, generation))
        }
    }

    fn undeclared(&self, label: &VarLabel, material: usize, generation: Generation) -> Error {
        Error::VariableNotFound {
            name: label.name.clone(),
            patch: self.patch.id(),
            material,
            generation,
        }
    }
}




type Constructor = Box<dyn Fn(&TaskSpec) -> Box<dyn Kernel> + Send + Sync>;

/// Maps kernel kinds to constructors, and holds the variable labels known to
/// the run. Built explicitly during setup and handed to whatever needs it.
#[derive(Default)]
pub struct Registry {
    constructors: HashMap<String, Constructor>,
    labels: Vec<VarLabel>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F) -> &mut Self
    where
        F: Fn(&TaskSpec) -> Box<dyn Kernel> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.to_string(), Box::new(constructor));
        self
    }

    pub fn declare(&mut self, label: VarLabel) -> &mut Self {
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
        self
    }

    pub fn labels(&self) -> &[VarLabel] {
        &self.labels
    }

    pub fn label(&self, name: &str) -> Option<&VarLabel> {
        self.labels.iter().find(|l| l.name == name)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Construct the task described by `spec`, or `None` if its kind was
    /// never registered.
    pub fn create(&self, spec: &TaskSpec) -> Option<Task> {
        let constructor = self.constructors.get(&spec.kind)?;
        let task = Task::new(&spec.name, constructor(spec), spec.patches.clone(), spec.materials.clone());
        Some(task.with_access(spec.access.clone()))
    }

    /// Create an empty data warehouse which already knows every declared
    /// label's type.
    pub fn warehouse(&self) -> Result<DataWarehouse> {
        DataWarehouse::with_labels(self.labels.iter())
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use std::collections::BTreeMap;

    use super::{kernel_fn, Access, Registry, Task, TaskContext, TaskSpec};
    use crate::error::Error;
    use crate::index_space::range3d;
    use crate::patch::Grid;
    use crate::variable::VarLabel;
    use crate::warehouse::{DataWarehouse, Generation};

    fn rho() -> VarLabel {
        VarLabel::cell::<f64>("rho")
    }

    fn energy() -> VarLabel {
        VarLabel::cell::<f64>("energy")
    }

    fn producer() -> Task {
        Task::new(
            "init",
            kernel_fn(|access: &mut Access| { access.computes(&rho()); }, |_| Ok(())),
            vec![0],
            vec![0],
        )
    }

    #[test]
    fn access_lists_come_from_the_kernel() {
        let task = producer();
        assert_eq!(task.access().computes, vec![rho()]);
        assert!(task.access().reads("rho", Generation::New));
        assert!(!task.access().reads("rho", Generation::Old));
    }

    #[test]
    fn context_allocates_with_halo_and_guards_undeclared_access() {
        let grid = Grid::decompose(&range3d(0..4, 0..4, 0..4), (1, 1, 1), 1);
        let mut dw = DataWarehouse::new();
        let task = producer();
        let halo: BTreeMap<_, _> = vec![("rho".to_string(), 2)].into_iter().collect();
        let mut ctx = TaskContext::new(&mut dw, &task, grid.get(0).unwrap(), &halo);

        let field = ctx.allocate::<f64>(&rho(), 0).unwrap();
        assert_eq!(field.storage(), &range3d(-2..6, -2..6, -2..6));
        assert!(matches!(ctx.allocate::<f32>(&rho(), 0), Err(Error::TypeMismatch { .. })));
        assert!(matches!(ctx.allocate::<f64>(&energy(), 0), Err(Error::VariableNotFound { .. })));
        assert!(matches!(ctx.put(&rho(), 3, field.clone()), Err(Error::VariableNotFound { material: 3, .. })));

        ctx.put(&rho(), 0, field).unwrap();
        assert!(ctx.get::<f64>(&rho(), 0, Generation::New).is_ok());
        assert!(ctx.get::<f64>(&energy(), 0, Generation::Old).is_err());
    }

    #[test]
    fn registry_constructs_tasks_by_kind() {
        let mut registry = Registry::new();
        registry.declare(rho()).declare(rho());
        registry.register("init", |_| kernel_fn(|access: &mut Access| { access.computes(&rho()); }, |_| Ok(())));

        let mut extra = Access::default();
        extra.requires(&energy(), Generation::Old, 0);
        let spec = TaskSpec {
            name: "init-rho".to_string(),
            kind: "init".to_string(),
            patches: vec![0, 1],
            materials: vec![0],
            access: extra,
        };
        let task = registry.create(&spec).unwrap();
        assert_eq!(task.name(), "init-rho");
        assert_eq!(task.patches(), &[0, 1]);
        assert_eq!(task.access().requires.len(), 1);
        assert_eq!(task.access().computes.len(), 1);
        assert_eq!(registry.labels().len(), 1);

        let unknown = TaskSpec { kind: "radiation".to_string(), ..spec };
        assert!(registry.create(&unknown).is_none());
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["init"]);
    }
}
