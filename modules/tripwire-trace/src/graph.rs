use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, DeError, Graph, Row};

use tripwire_common::error::Result;
use tripwire_common::{GraphNode, GraphRelationship, TripwireError};

use crate::store::{GraphStore, Subgraph};

/// Upper bound on traversal depth; variable-length patterns grow fast.
const MAX_DEPTH: u32 = 5;

/// Thin wrapper around neo4rs::Graph providing connection setup.
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .fetch_size(500)
            .max_connections(10)
            .build()?;
        let graph = Graph::connect(config).await?;
        Ok(Self { graph })
    }

    pub fn inner(&self) -> &Graph {
        &self.graph
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> bool {
        match self.graph.execute(query("RETURN 1 AS ok")).await {
            Ok(mut stream) => matches!(stream.next().await, Ok(Some(_))),
            Err(_) => false,
        }
    }
}

/// Neighborhood reads over `(:Object {id})` nodes.
#[derive(Clone)]
pub struct Neo4jGraph {
    client: GraphClient,
}

impl Neo4jGraph {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    async fn nodes(&self, ids: &[String], depth: u32) -> Result<Vec<GraphNode>> {
        let cypher = format!(
            "MATCH (start:Object) WHERE start.id IN $ids
             MATCH (start)-[*0..{depth}]-(n)
             WITH DISTINCT n
             RETURN coalesce(toString(n.id), elementId(n)) AS node_id,
                    labels(n) AS labels,
                    properties(n) AS props"
        );
        let q = query(&cypher).param("ids", ids.to_vec());

        let mut nodes = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            if let Some(node) = node_from_row(&row)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn relationships(&self, ids: &[String], depth: u32) -> Result<Vec<GraphRelationship>> {
        let cypher = format!(
            "MATCH (start:Object) WHERE start.id IN $ids
             MATCH (start)-[rs*1..{depth}]-()
             UNWIND rs AS r
             WITH DISTINCT r
             RETURN elementId(r) AS rel_id,
                    type(r) AS rel_type,
                    coalesce(toString(startNode(r).id), elementId(startNode(r))) AS start_id,
                    coalesce(toString(endNode(r).id), elementId(endNode(r))) AS end_id,
                    properties(r) AS props"
        );
        let q = query(&cypher).param("ids", ids.to_vec());

        let mut relationships = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            relationships.push(relationship_from_row(&row)?);
        }
        Ok(relationships)
    }
}

/// Rows without an id are skipped. A column that fails to decode fails the
/// whole read so the snapshot records the error instead of a partial graph.
fn node_from_row(row: &Row) -> Result<Option<GraphNode>> {
    let id: String = row.get("node_id").map_err(decode_error)?;
    if id.is_empty() {
        return Ok(None);
    }
    Ok(Some(GraphNode {
        id,
        labels: row.get("labels").map_err(decode_error)?,
        properties: row.get("props").map_err(decode_error)?,
    }))
}

fn relationship_from_row(row: &Row) -> Result<GraphRelationship> {
    Ok(GraphRelationship {
        id: row.get("rel_id").map_err(decode_error)?,
        rel_type: row.get("rel_type").map_err(decode_error)?,
        start: row.get("start_id").map_err(decode_error)?,
        end: row.get("end_id").map_err(decode_error)?,
        properties: row.get("props").map_err(decode_error)?,
    })
}

fn decode_error(e: DeError) -> TripwireError {
    TripwireError::Graph(neo4rs::Error::DeserializationError(e))
}

#[async_trait]
impl GraphStore for Neo4jGraph {
    async fn neighborhood(&self, ids: &[String], depth: u32) -> Result<Subgraph> {
        if ids.is_empty() {
            return Ok(Subgraph::default());
        }
        if depth > MAX_DEPTH {
            return Err(TripwireError::Validation(format!(
                "graph depth {depth} exceeds {MAX_DEPTH}"
            )));
        }

        let nodes = self.nodes(ids, depth).await?;
        let relationships = if depth == 0 {
            Vec::new()
        } else {
            self.relationships(ids, depth).await?
        };
        Ok(Subgraph {
            nodes,
            relationships,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neo4rs::{BoltList, BoltMap, BoltType};

    fn row(columns: Vec<(&str, BoltType)>) -> Row {
        let (fields, data): (Vec<BoltType>, Vec<BoltType>) = columns
            .into_iter()
            .map(|(name, value)| (BoltType::from(name), value))
            .unzip();
        Row::new(BoltList::from(fields), BoltList::from(data))
    }

    fn labels(names: &[&str]) -> BoltType {
        BoltType::List(BoltList::from(
            names.iter().map(|n| BoltType::from(*n)).collect::<Vec<_>>(),
        ))
    }

    fn props(id: &str) -> BoltType {
        let mut map = BoltMap::new();
        map.put("id".into(), BoltType::from(id));
        BoltType::Map(map)
    }

    #[test]
    fn node_row_decodes() {
        let node = node_from_row(&row(vec![
            ("node_id", BoltType::from("obj-1")),
            ("labels", labels(&["Object"])),
            ("props", props("obj-1")),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(node.id, "obj-1");
        assert_eq!(node.labels, vec!["Object".to_string()]);
        assert_eq!(node.properties["id"], "obj-1");
    }

    #[test]
    fn node_row_without_id_is_skipped() {
        let node = node_from_row(&row(vec![
            ("node_id", BoltType::from("")),
            ("labels", labels(&[])),
            ("props", props("")),
        ]))
        .unwrap();
        assert!(node.is_none());
    }

    #[test]
    fn undecodable_node_column_is_an_error() {
        let err = node_from_row(&row(vec![
            ("node_id", BoltType::from("obj-1")),
            ("labels", BoltType::from("Object")),
            ("props", props("obj-1")),
        ]))
        .unwrap_err();
        assert!(matches!(err, TripwireError::Graph(_)));
    }

    #[test]
    fn missing_relationship_column_is_an_error() {
        let err = relationship_from_row(&row(vec![
            ("rel_id", BoltType::from("5:abc:0")),
            ("rel_type", BoltType::from("RELATES_TO")),
            ("start_id", BoltType::from("obj-1")),
            ("props", props("r1")),
        ]))
        .unwrap_err();
        assert!(matches!(err, TripwireError::Graph(_)));
    }
}
