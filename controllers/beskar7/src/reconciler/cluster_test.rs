//! Unit tests for the Beskar7Cluster reconciler

mod tests {
    use crate::reconciler::cluster::zone_failure_domains;
    use crate::test_utils::*;

    fn host_in_zone(name: &str, zone: &str) -> crds::PhysicalHost {
        let mut host = available_host("metal", name);
        host.metadata
            .labels
            .get_or_insert_default()
            .insert(crds::LABEL_TOPOLOGY_ZONE.to_string(), zone.to_string());
        host
    }

    #[test]
    fn failure_domains_deduplicate_zones() {
        let hosts = vec![
            host_in_zone("h-a", "zone-a"),
            host_in_zone("h-b", "zone-a"),
            host_in_zone("h-c", "zone-b"),
        ];
        let domains = zone_failure_domains(&hosts);
        assert_eq!(domains.len(), 2);
        assert!(domains.contains_key("zone-a"));
        assert!(domains.contains_key("zone-b"));
        assert!(domains.values().all(|d| d.control_plane));
    }

    #[test]
    fn hosts_without_zone_labels_are_skipped() {
        let hosts = vec![available_host("metal", "h-a"), host_in_zone("h-b", "zone-a")];
        let domains = zone_failure_domains(&hosts);
        assert_eq!(domains.len(), 1);
    }

    #[test]
    fn empty_pool_yields_no_failure_domains() {
        assert!(zone_failure_domains(&[]).is_empty());
    }
}
