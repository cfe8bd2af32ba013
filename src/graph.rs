use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    QueryOrRespond,
    Tools,
    ProcessToolResponse,
    Retrieve,
    RerankDocuments,
    Generate,
    RouterRespond,
    End,
}

impl Node {
    pub fn as_str(self) -> &'static str {
        match self {
            Node::QueryOrRespond => "query_or_respond",
            Node::Tools => "tools",
            Node::ProcessToolResponse => "process_tool_response",
            Node::Retrieve => "retrieve",
            Node::RerankDocuments => "rerank_documents",
            Node::Generate => "generate",
            Node::RouterRespond => "router_respond",
            Node::End => "__end__",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    DirectReply,
    ToolRequested,
}

/// The turn's state machine. Conversational turns go through the tool-calling
/// agent and the router; the rest retrieve directly and end at `generate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Graph {
    conversational: bool,
    rerank: bool,
}

impl Graph {
    pub fn new(conversational: bool, rerank: bool) -> Self {
        Self {
            conversational,
            rerank,
        }
    }

    pub fn is_conversational(&self) -> bool {
        self.conversational
    }

    pub fn start(&self) -> Node {
        if self.conversational {
            Node::QueryOrRespond
        } else {
            Node::Retrieve
        }
    }

    pub fn transition(&self, node: Node, outcome: Outcome) -> Node {
        match (node, outcome) {
            (Node::QueryOrRespond, Outcome::ToolRequested) => Node::Tools,
            (Node::QueryOrRespond, _) => Node::End,
            (Node::Tools, _) => Node::ProcessToolResponse,
            (Node::ProcessToolResponse | Node::Retrieve, _) => self.after_retrieval(),
            (Node::RerankDocuments, _) => Node::Generate,
            (Node::Generate, _) if self.conversational => Node::RouterRespond,
            (Node::Generate, _) => Node::End,
            (Node::RouterRespond | Node::End, _) => Node::End,
        }
    }

    fn after_retrieval(&self) -> Node {
        if self.rerank {
            Node::RerankDocuments
        } else {
            Node::Generate
        }
    }

    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes = if self.conversational {
            vec![Node::QueryOrRespond, Node::Tools, Node::ProcessToolResponse]
        } else {
            vec![Node::Retrieve]
        };
        if self.rerank {
            nodes.push(Node::RerankDocuments);
        }
        nodes.push(Node::Generate);
        if self.conversational {
            nodes.push(Node::RouterRespond);
        }
        nodes
    }

    pub fn edges(&self) -> Vec<(Node, Node)> {
        let outcomes = [Outcome::Continue, Outcome::DirectReply, Outcome::ToolRequested];
        let mut edges = Vec::new();
        for node in self.nodes() {
            for outcome in outcomes {
                let edge = (node, self.transition(node, outcome));
                if !edges.contains(&edge) {
                    edges.push(edge);
                }
            }
        }
        edges
    }

    pub fn is_visible(&self, node: Node) -> bool {
        match node {
            Node::RouterRespond => true,
            Node::Generate => !self.conversational,
            Node::QueryOrRespond => self.conversational,
            _ => false,
        }
    }
}
