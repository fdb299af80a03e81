use std::sync::Arc;

use yangbus::{Config, Connection, SchemaModule, SchemaNode, SchemaTree, Subscriptions};

pub fn schema() -> Arc<SchemaTree> {
    Arc::new(SchemaTree::new(vec![
        SchemaModule::new(
            "ietf-interfaces",
            vec![SchemaNode::container("interfaces").with_children(vec![
                SchemaNode::list("interface").with_children(vec![
                    SchemaNode::leaf("name").key(),
                    SchemaNode::leaf("enabled"),
                    SchemaNode::leaf("oper-status").state(),
                ]),
            ])],
        ),
        SchemaModule::new(
            "my-mod",
            vec![
                SchemaNode::container("config-tree")
                    .with_children(vec![SchemaNode::leaf("knob")]),
                SchemaNode::container("state-tree")
                    .state()
                    .with_children(vec![SchemaNode::leaf("gauge").state()]),
                SchemaNode::container("mixed-tree").with_children(vec![
                    SchemaNode::leaf("knob"),
                    SchemaNode::leaf("gauge").state(),
                ]),
                SchemaNode::notification("alarm")
                    .with_children(vec![SchemaNode::leaf("severity")]),
                SchemaNode::rpc("reset"),
            ],
        ),
    ]))
}

pub fn establish(dir: &tempfile::TempDir) -> (Arc<Connection>, Arc<Subscriptions>) {
    let conn = Connection::establish(Config::new(dir.path()), schema()).unwrap();
    let subscr = Subscriptions::new(&conn);
    (conn, subscr)
}
