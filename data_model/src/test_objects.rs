pub mod tests {
    use std::collections::HashMap;

    use rand::{distr::Alphanumeric, Rng};

    use crate::{
        Container,
        ContainerBuilder,
        NodeHealth,
        NodeInfo,
        NodeName,
    };

    pub const TEST_CLUSTER: &str = "test_cluster";
    pub const TEST_NODE: &str = "node-1";
    pub const TEST_IMAGE: &str = "reg/app:1.0";

    pub fn random_hex_id() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .filter(|c| c.is_ascii_hexdigit())
            .take(16)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect()
    }

    pub fn mock_container(name: &str, image: &str, node: &str) -> Container {
        ContainerBuilder::default()
            .id(Some(random_hex_id()))
            .name(Some(name.to_string()))
            .node(Some(node.to_string()))
            .image(image.to_string())
            .cluster(Some(TEST_CLUSTER.to_string()))
            .labels(HashMap::new())
            .build()
            .unwrap()
    }

    pub fn mock_node_info(name: &str) -> NodeInfo {
        NodeInfo {
            name: NodeName::from(name),
            address: "10.0.0.1:2376".to_string(),
            cluster: Some(TEST_CLUSTER.to_string()),
            labels: HashMap::new(),
            health: NodeHealth {
                healthy: true,
                ..Default::default()
            },
            on: true,
        }
    }
}
