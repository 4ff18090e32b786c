//! NetworkMap CRD: translation of source networks to target networks

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{MapStatus, ProviderPair};
use crate::refs::Ref;

/// Destination type tag for pod networking
pub const NETWORK_TYPE_POD: &str = "pod";
/// Destination type tag for a network attachment definition
pub const NETWORK_TYPE_MULTUS: &str = "multus";
/// Destination type tag for NICs that are dropped
pub const NETWORK_TYPE_IGNORED: &str = "ignored";

/// NetworkMap maps source networks onto pod or multus networks.
///
/// ```yaml
/// apiVersion: forklift.konveyor.io/v1beta1
/// kind: NetworkMap
/// metadata:
///   name: prod-networks
/// spec:
///   provider:
///     source: {namespace: forklift, name: vsphere-prod}
///     destination: {namespace: forklift, name: host}
///   map:
///     - source: {id: network-12}
///       destination: {type: pod}
///     - source: {name: "VM Network"}
///       destination: {type: multus, namespace: vms, name: vlan10}
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "NetworkMap",
    namespaced,
    status = "MapStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMapSpec {
    /// Provider pair
    pub provider: ProviderPair,

    /// Ordered mapping pairs; the first match wins
    #[serde(default)]
    pub map: Vec<NetworkPair>,
}

/// One source network and where it lands
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPair {
    /// Source network
    #[serde(default)]
    pub source: Ref,
    /// Target network
    pub destination: DestinationNetwork,
}

/// Target side of a network pair, as written by the user
///
/// `type` is kept as a string so an unknown tag can be reported as a
/// condition instead of failing deserialization.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationNetwork {
    /// `pod`, `multus` or `ignored`
    #[serde(rename = "type")]
    pub type_: String,
    /// Attachment definition namespace (multus)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Attachment definition name (multus)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Decoded network destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkDestination<'a> {
    /// Default pod network
    Pod,
    /// Secondary network via an attachment definition
    Multus {
        /// Namespace of the attachment definition
        namespace: &'a str,
        /// Name of the attachment definition
        name: &'a str,
    },
    /// NIC is not carried over
    Ignored,
}

impl DestinationNetwork {
    /// Pod network destination
    pub fn pod() -> Self {
        Self {
            type_: NETWORK_TYPE_POD.to_string(),
            ..Default::default()
        }
    }

    /// Multus destination
    pub fn multus(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_: NETWORK_TYPE_MULTUS.to_string(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Ignored destination
    pub fn ignored() -> Self {
        Self {
            type_: NETWORK_TYPE_IGNORED.to_string(),
            ..Default::default()
        }
    }

    /// Decode the tag, `None` for an unknown type
    pub fn decode(&self) -> Option<NetworkDestination<'_>> {
        match self.type_.as_str() {
            NETWORK_TYPE_POD => Some(NetworkDestination::Pod),
            NETWORK_TYPE_MULTUS => Some(NetworkDestination::Multus {
                namespace: &self.namespace,
                name: &self.name,
            }),
            NETWORK_TYPE_IGNORED => Some(NetworkDestination::Ignored),
            _ => None,
        }
    }
}

impl NetworkMap {
    /// First pair whose source id equals `id`
    pub fn find_network(&self, id: &str) -> Option<&NetworkPair> {
        self.spec.map.iter().find(|p| p.source.id == id)
    }

    /// First pair whose source type equals `type_`
    pub fn find_network_by_type(&self, type_: &str) -> Option<&NetworkPair> {
        self.spec.map.iter().find(|p| p.source.type_ == type_)
    }

    /// First pair matching namespace and name; falls back to a pair whose
    /// name encodes the namespace as `ns/name`.
    pub fn find_network_by_name_and_namespace(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<&NetworkPair> {
        self.spec
            .map
            .iter()
            .find(|p| p.source.namespace == namespace && p.source.name == name)
            .or_else(|| {
                let joined = format!("{namespace}/{name}");
                self.spec.map.iter().find(|p| p.source.name == joined)
            })
    }

    /// Pair for a source network, preferring the id and then the name.
    /// An empty id or name never matches.
    pub fn find_network_for(&self, id: &str, namespace: &str, name: &str) -> Option<&NetworkPair> {
        if !id.is_empty() {
            if let Some(pair) = self.find_network(id) {
                return Some(pair);
            }
        }
        if name.is_empty() {
            return None;
        }
        if namespace.is_empty() {
            self.spec
                .map
                .iter()
                .find(|p| p.source.id.is_empty() && p.source.name == name)
        } else {
            self.find_network_by_name_and_namespace(namespace, name)
        }
    }

    /// Ready according to the last validation pass
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_ready())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::ObjectRef;

    fn network_map(pairs: Vec<NetworkPair>) -> NetworkMap {
        NetworkMap::new(
            "test",
            NetworkMapSpec {
                provider: ProviderPair {
                    source: ObjectRef::new("ns", "src"),
                    destination: ObjectRef::new("ns", "host"),
                },
                map: pairs,
            },
        )
    }

    fn pair(source: Ref, destination: DestinationNetwork) -> NetworkPair {
        NetworkPair {
            source,
            destination,
        }
    }

    fn sample() -> NetworkMap {
        network_map(vec![
            pair(
                Ref {
                    id: "network-1".into(),
                    name: "network-one".into(),
                    ..Default::default()
                },
                DestinationNetwork::pod(),
            ),
            pair(
                Ref {
                    id: "network-2".into(),
                    name: "network-two".into(),
                    namespace: "ns1".into(),
                    type_: "udn".into(),
                },
                DestinationNetwork::multus("ns1", "net-a"),
            ),
            pair(
                Ref::with_name("ns1/network-three"),
                DestinationNetwork::ignored(),
            ),
            pair(Ref::with_id("network-1"), DestinationNetwork::ignored()),
        ])
    }

    #[test]
    fn empty_source_is_not_set() {
        let p = pair(Ref::default(), DestinationNetwork::pod());
        assert!(p.source.not_set());
    }

    #[test]
    fn find_network_returns_first_id_match() {
        let map = sample();
        let found = map.find_network("network-1").expect("found");
        assert_eq!(found.destination.type_, NETWORK_TYPE_POD);
        assert!(map.find_network("missing").is_none());
    }

    #[test]
    fn find_network_by_type() {
        let map = sample();
        assert_eq!(
            map.find_network_by_type("udn").map(|p| p.source.id.as_str()),
            Some("network-2")
        );
        assert!(map.find_network_by_type("other").is_none());
    }

    #[test]
    fn find_by_name_and_namespace_matches_fields_then_joined_name() {
        let map = sample();
        let found = map
            .find_network_by_name_and_namespace("ns1", "network-two")
            .expect("field match");
        assert_eq!(found.source.id, "network-2");

        let found = map
            .find_network_by_name_and_namespace("ns1", "network-three")
            .expect("joined name match");
        assert_eq!(found.destination.type_, NETWORK_TYPE_IGNORED);

        assert!(map
            .find_network_by_name_and_namespace("ns2", "network-three")
            .is_none());
    }

    #[test]
    fn lookup_round_trip_by_id() {
        let pairs: Vec<NetworkPair> = (0..5)
            .map(|i| {
                pair(
                    Ref::with_id(format!("net-{i}")),
                    DestinationNetwork::multus("vms", format!("nad-{i}")),
                )
            })
            .collect();
        let map = network_map(pairs.clone());
        let json = serde_json::to_string(&map).unwrap();
        let map: NetworkMap = serde_json::from_str(&json).unwrap();

        for p in &pairs {
            assert_eq!(
                map.find_network(&p.source.id).map(|f| &f.destination),
                Some(&p.destination)
            );
        }
    }

    mod name_only {
        use super::*;
        use rstest::rstest;

        fn by_name() -> NetworkMap {
            network_map(vec![
                pair(Ref::with_name("net-a"), DestinationNetwork::pod()),
                pair(Ref::with_name("net-b"), DestinationNetwork::ignored()),
                pair(
                    Ref {
                        name: "net-c".into(),
                        namespace: "tenant".into(),
                        ..Default::default()
                    },
                    DestinationNetwork::multus("vms", "nad-c"),
                ),
                pair(Ref::with_name("tenant/net-d"), DestinationNetwork::pod()),
            ])
        }

        /// Inventory objects reported without an id resolve by name only
        #[rstest]
        #[case::first("", "", "net-a", Some("net-a"))]
        #[case::second("", "", "net-b", Some("net-b"))]
        #[case::namespaced("", "tenant", "net-c", Some("net-c"))]
        #[case::joined("", "tenant", "net-d", Some("tenant/net-d"))]
        #[case::unknown_id_then_name("nic-9", "", "net-b", Some("net-b"))]
        #[case::unmapped("", "", "not-in-map", None)]
        #[case::wrong_namespace("", "other", "net-c", None)]
        #[case::empty("", "", "", None)]
        fn resolves_without_id(
            #[case] id: &str,
            #[case] namespace: &str,
            #[case] name: &str,
            #[case] expected: Option<&str>,
        ) {
            let map = by_name();
            assert_eq!(
                map.find_network_for(id, namespace, name)
                    .map(|p| p.source.name.as_str()),
                expected
            );
        }
    }

    #[test]
    fn decode_destination() {
        assert_eq!(DestinationNetwork::pod().decode(), Some(NetworkDestination::Pod));
        assert_eq!(
            DestinationNetwork::multus("a", "b").decode(),
            Some(NetworkDestination::Multus {
                namespace: "a",
                name: "b"
            })
        );
        let unknown = DestinationNetwork {
            type_: "bridge".into(),
            ..Default::default()
        };
        assert!(unknown.decode().is_none());
    }
}
