//! Brings a freshly created interface administratively up via netlink.

use futures::TryStreamExt as _;
use rtnetlink::{Error::NetlinkError, Handle, LinkUnspec, new_connection};
use tokio_util::task::AbortOnDropHandle;

use crate::Error;

/// Sets the link named `name` to "up" and returns its interface index.
///
/// Opens a dedicated netlink session which is closed again regardless of the outcome.
pub async fn activate_link(name: &str) -> Result<u32, Error> {
    let (connection, handle, _) = new_connection().map_err(Error::NetlinkSession)?;
    let _session = spawn_session(connection);

    set_link_up(&handle, name).await
}

/// Drives a netlink connection until the returned handle is dropped.
fn spawn_session<C>(connection: C) -> AbortOnDropHandle<()>
where
    C: Future<Output = ()> + Send + 'static,
{
    AbortOnDropHandle::new(tokio::spawn(connection))
}

async fn set_link_up(handle: &Handle, name: &str) -> Result<u32, Error> {
    let link = match handle
        .link()
        .get()
        .match_name(name.to_owned())
        .execute()
        .try_next()
        .await
    {
        Ok(Some(link)) => link,
        Ok(None) => {
            return Err(Error::LinkNotFound {
                name: name.to_owned(),
            });
        }
        // The kernel answers a lookup by name for an unknown interface with "No such device".
        Err(NetlinkError(e)) if e.raw_code() == -libc::ENODEV => {
            return Err(Error::LinkNotFound {
                name: name.to_owned(),
            });
        }
        Err(source) => {
            return Err(Error::LinkLookup {
                name: name.to_owned(),
                source,
            });
        }
    };

    let index = link.header.index;

    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .map_err(|source| Error::LinkModify {
            name: name.to_owned(),
            source,
        })?;

    tracing::debug!(%name, %index, "Brought link up");

    Ok(index)
}
