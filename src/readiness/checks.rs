//! Commands run on the instance to verify the application stack.

use shell_escape::unix::escape;

/// Lists running container names, one per line.
pub const CONTAINERS_COMMAND: &str = "docker ps --format '{{.Names}}'";

/// Names and endpoints the application checks expect on the instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceExpectations {
    /// Container name of the model server.
    pub primary_service: String,
    /// Container name of the web front end.
    pub secondary_service: String,
    /// Port serving the liveness endpoint.
    pub health_port: u16,
    /// Port serving the catalog endpoint.
    pub catalog_port: u16,
    /// Identifier that must appear in the catalog.
    pub workload_id: String,
}

impl ServiceExpectations {
    /// URL of the liveness endpoint, as seen from the instance.
    #[must_use]
    pub fn health_url(&self) -> String {
        format!("http://localhost:{}/health", self.health_port)
    }

    /// URL of the catalog endpoint, as seen from the instance.
    #[must_use]
    pub fn catalog_url(&self) -> String {
        format!("http://localhost:{}/api/tags", self.catalog_port)
    }

    /// Prints only the HTTP status code of the liveness endpoint.
    #[must_use]
    pub fn health_command(&self) -> String {
        let url = self.health_url();
        format!(
            "curl -s -o /dev/null -w '%{{http_code}}' --max-time 5 {}",
            escape(url.as_str().into())
        )
    }

    /// Prints the catalog response body.
    #[must_use]
    pub fn catalog_command(&self) -> String {
        let url = self.catalog_url();
        format!("curl -s --max-time 10 {}", escape(url.as_str().into()))
    }

    /// Returns the expected names missing from `docker ps` output.
    #[must_use]
    pub fn missing_services(&self, listing: &str) -> Vec<&str> {
        [self.primary_service.as_str(), self.secondary_service.as_str()]
            .into_iter()
            .filter(|name| !listing.lines().any(|line| line.contains(name)))
            .collect()
    }

    /// Returns `true` when the catalog body mentions the workload. The match
    /// is a case-sensitive substring search.
    #[must_use]
    pub fn catalog_lists_workload(&self, body: &str) -> bool {
        body.contains(self.workload_id.as_str())
    }
}

/// Returns `true` when curl reported HTTP 200.
#[must_use]
pub fn is_http_ok(status_output: &str) -> bool {
    status_output.trim() == "200"
}
