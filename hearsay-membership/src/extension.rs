use async_trait::async_trait;

use crate::MembershipNode;

#[async_trait]
/// An extension of the base membership node.
///
/// This can be used to extend a node with additional functionality,
/// like leader election, which wants to observe the membership of the group.
pub trait ClusterExtension {
    type Output;
    type Error;

    async fn init_extension(
        self,
        node: &MembershipNode,
    ) -> Result<Self::Output, Self::Error>;
}
