//! Organizational hierarchy snapshot consumed by the planner and resolver
//!
//! Department/project CRUD lives outside this crate; the workflow only ever
//! reads a snapshot of manager assignments through [`HierarchySnapshot`].

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Employee,
    Manager,
    Finance,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Employee => "Employee",
            Role::Manager => "Manager",
            Role::Finance => "Finance",
            Role::Admin => "Admin",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Department {
    pub id: String,
    pub manager_id: Option<String>,
    pub second_manager_id: Option<String>,
    pub third_manager_id: Option<String>,
    pub parent_id: Option<String>, // must not cycle, owned by the org service
}

#[derive(Debug, Clone, Default)]
pub struct Project {
    pub id: String,
    pub manager_id: Option<String>,
    pub second_manager_id: Option<String>,
}

/// Read-only view of the org chart. May be cached by implementations; the
/// workflow treats each call as a point-in-time snapshot.
pub trait HierarchySnapshot: Send + Sync {
    fn department(&self, id: &str) -> Option<Department>;
    fn project(&self, id: &str) -> Option<Project>;
    fn home_department(&self, user_id: &str) -> Option<String>;
    fn kilometer_threshold(&self) -> u32;
}

/// In-memory hierarchy for tests and embedded use.
#[derive(Default)]
pub struct StaticHierarchy {
    departments: RwLock<HashMap<String, Department>>,
    projects: RwLock<HashMap<String, Project>>,
    home_departments: RwLock<HashMap<String, String>>,
    kilometer_threshold: u32,
}

impl StaticHierarchy {
    pub fn new(kilometer_threshold: u32) -> Self {
        Self {
            kilometer_threshold,
            ..Default::default()
        }
    }
    pub fn insert_department(&self, department: Department) {
        self.departments
            .write()
            .unwrap()
            .insert(department.id.clone(), department);
    }
    pub fn insert_project(&self, project: Project) {
        self.projects
            .write()
            .unwrap()
            .insert(project.id.clone(), project);
    }
    pub fn set_home_department(&self, user_id: &str, department_id: &str) {
        self.home_departments
            .write()
            .unwrap()
            .insert(user_id.to_string(), department_id.to_string());
    }
}

impl HierarchySnapshot for StaticHierarchy {
    fn department(&self, id: &str) -> Option<Department> {
        self.departments.read().unwrap().get(id).cloned()
    }
    fn project(&self, id: &str) -> Option<Project> {
        self.projects.read().unwrap().get(id).cloned()
    }
    fn home_department(&self, user_id: &str) -> Option<String> {
        self.home_departments.read().unwrap().get(user_id).cloned()
    }
    fn kilometer_threshold(&self) -> u32 {
        self.kilometer_threshold
    }
}
