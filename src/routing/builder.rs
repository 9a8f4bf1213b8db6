use std::collections::HashMap;

use crate::routing::{AgentRecord, Department, InMemoryDirectory};

/// Builder for an in-memory agent/department directory.
#[derive(Clone, Debug, Default)]
pub struct DirectoryBuilder {
    agents: Vec<AgentRecord>,
    departments: Vec<Department>,
    required_department: Option<String>,
}

impl DirectoryBuilder {
    /// Create an empty directory builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent to the directory.
    pub fn agent(mut self, agent: AgentRecord) -> Self {
        self.agents.push(agent);
        self
    }

    /// Add a department to the directory.
    pub fn department(mut self, department: Department) -> Self {
        self.departments.push(department);
        self
    }

    /// Force every departmentless lookup through the given department.
    pub fn required_department(mut self, department_id: impl Into<String>) -> Self {
        self.required_department = Some(department_id.into());
        self
    }

    /// Build the directory. Later entries win on duplicate ids.
    pub fn build(self) -> InMemoryDirectory {
        let mut agents = HashMap::with_capacity(self.agents.len());
        for agent in self.agents {
            agents.insert(agent.id.clone(), agent);
        }

        let mut departments = HashMap::with_capacity(self.departments.len());
        for department in self.departments {
            departments.insert(department.id.clone(), department);
        }

        InMemoryDirectory::from_parts(agents, departments, self.required_department)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{AgentDirectory, AgentStatus};

    #[test]
    fn test_builder_assembles_directory() {
        let directory = DirectoryBuilder::new()
            .agent(AgentRecord::new("a1", "alice"))
            .agent(AgentRecord::new("a2", "bob").with_status(AgentStatus::Busy))
            .department(Department::new("sales", "Sales").with_agents(["a1", "a2"]))
            .required_department("sales")
            .build();

        let agents = directory.agents_in(Some("sales")).expect("lookup failed");
        assert_eq!(agents.len(), 2);
        assert_eq!(
            directory.required_department().expect("lookup failed"),
            Some("sales".to_string())
        );
    }

    #[test]
    fn test_duplicate_agent_ids_keep_last() {
        let directory = DirectoryBuilder::new()
            .agent(AgentRecord::new("a1", "alice"))
            .agent(AgentRecord::new("a1", "alicia"))
            .build();

        let agent = directory
            .agent("a1")
            .expect("lookup failed")
            .expect("agent missing");
        assert_eq!(agent.username, "alicia");
    }

    #[test]
    fn test_department_membership_ignores_unknown_agents() {
        let directory = DirectoryBuilder::new()
            .agent(AgentRecord::new("a1", "alice"))
            .department(Department::new("sales", "Sales").with_agents(["a1", "ghost"]))
            .build();

        let agents = directory.agents_in(Some("sales")).expect("lookup failed");
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].username, "alice");
    }
}
