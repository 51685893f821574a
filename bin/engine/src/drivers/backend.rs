use super::CreateSpec;

/// Per-kind command templates. A `ShellDriver` is generic over this so
/// the four backends share one execution/retry/progress skeleton
/// instead of duplicating it.
pub trait Backend: Send + Sync {
  fn supports_vm(&self) -> bool {
    false
  }

  /// Docker forces shell-only and `native` port mapping regardless of
  /// policy (§4.B); other backends may be dispatched per policy.
  fn shell_only(&self) -> bool {
    false
  }

  fn create_cmd(&self, spec: &CreateSpec) -> String;
  fn start_cmd(&self, name: &str) -> String;
  fn stop_cmd(&self, name: &str) -> String;
  fn restart_cmd(&self, name: &str) -> String;
  fn delete_cmd(&self, name: &str) -> String;
  fn version_cmd(&self) -> String;
  fn set_password_cmd(&self, name: &str, password: &str) -> String;
  fn readiness_probe_cmd(&self, name: &str) -> String;

  /// `(path, body)` for a `POST` that creates `spec` over the native
  /// API. `None` means this backend has no REST-addressable create and
  /// the shell command is the only path (Docker, Proxmox's vmid
  /// addressing).
  fn api_create_request(&self, _spec: &CreateSpec) -> Option<(String, serde_json::Value)> {
    None
  }

  /// `(path, body)` for a `PUT` that drives `name` into `action`
  /// (`"start"`/`"stop"`/`"restart"`).
  fn api_state_request(&self, _name: &str, _action: &str) -> Option<(String, serde_json::Value)> {
    None
  }

  /// Path for a `DELETE` against `name`. `None` falls back to shell.
  fn api_delete_path(&self, _name: &str) -> Option<String> {
    None
  }
}

/// Lxd and Incus share the same `/1.0/instances` REST shape.
fn lxd_style_create_request(spec: &CreateSpec) -> (String, serde_json::Value) {
  let instance_type = match spec.kind {
    engine_client::entities::instance::InstanceKind::Vm => "virtual-machine",
    engine_client::entities::instance::InstanceKind::Container => "container",
  };
  (
    "/1.0/instances".to_string(),
    serde_json::json!({
      "name": spec.name,
      "source": { "type": "image", "alias": spec.image },
      "config": {
        "limits.cpu": spec.cpu_cores.to_string(),
        "limits.memory": format!("{}MB", spec.memory_mb),
      },
      "type": instance_type,
    }),
  )
}

fn lxd_style_state_request(name: &str, action: &str) -> (String, serde_json::Value) {
  (
    format!("/1.0/instances/{name}/state"),
    serde_json::json!({ "action": action, "timeout": 30, "force": false }),
  )
}

fn lxd_style_delete_path(name: &str) -> String {
  format!("/1.0/instances/{name}")
}

pub mod docker {
  use super::*;

  pub struct DockerBackend;

  impl Backend for DockerBackend {
    fn shell_only(&self) -> bool {
      true
    }

    fn create_cmd(&self, spec: &CreateSpec) -> String {
      format!(
        "docker run -d --name {} --cpus {} --memory {}m {}",
        spec.name, spec.cpu_cores, spec.memory_mb, spec.image
      )
    }

    fn start_cmd(&self, name: &str) -> String {
      format!("docker start {name}")
    }

    fn stop_cmd(&self, name: &str) -> String {
      format!("docker stop {name}")
    }

    fn restart_cmd(&self, name: &str) -> String {
      format!("docker restart {name}")
    }

    fn delete_cmd(&self, name: &str) -> String {
      format!("docker rm -f {name} 2>/dev/null || true")
    }

    fn version_cmd(&self) -> String {
      "docker version --format '{{.Server.Version}}'".into()
    }

    fn set_password_cmd(&self, name: &str, password: &str) -> String {
      format!(
        "docker exec {name} sh -c \"echo 'root:{password}' | chpasswd\""
      )
    }

    fn readiness_probe_cmd(&self, name: &str) -> String {
      format!("docker exec {name} echo ready")
    }
  }
}

pub mod lxd {
  use super::*;

  pub struct LxdBackend;

  impl Backend for LxdBackend {
    fn supports_vm(&self) -> bool {
      true
    }

    fn create_cmd(&self, spec: &CreateSpec) -> String {
      let vm_flag = matches!(
        spec.kind,
        engine_client::entities::instance::InstanceKind::Vm
      )
      .then_some("--vm")
      .unwrap_or_default();
      format!(
        "lxc launch {} {} {vm_flag} -c limits.cpu={} -c limits.memory={}MB",
        spec.image, spec.name, spec.cpu_cores, spec.memory_mb
      )
    }

    fn start_cmd(&self, name: &str) -> String {
      format!("lxc start {name}")
    }

    fn stop_cmd(&self, name: &str) -> String {
      format!("lxc stop {name}")
    }

    fn restart_cmd(&self, name: &str) -> String {
      format!("lxc restart {name}")
    }

    fn delete_cmd(&self, name: &str) -> String {
      format!("lxc delete --force {name} 2>/dev/null || true")
    }

    fn version_cmd(&self) -> String {
      "lxc version | head -n1 | awk '{print $2}'".into()
    }

    fn set_password_cmd(&self, name: &str, password: &str) -> String {
      format!(
        "lxc exec {name} -- sh -c \"echo 'root:{password}' | chpasswd\""
      )
    }

    fn readiness_probe_cmd(&self, name: &str) -> String {
      format!("lxc exec {name} -- echo ready")
    }

    fn api_create_request(&self, spec: &CreateSpec) -> Option<(String, serde_json::Value)> {
      Some(lxd_style_create_request(spec))
    }

    fn api_state_request(&self, name: &str, action: &str) -> Option<(String, serde_json::Value)> {
      Some(lxd_style_state_request(name, action))
    }

    fn api_delete_path(&self, name: &str) -> Option<String> {
      Some(lxd_style_delete_path(name))
    }
  }
}

pub mod incus {
  use super::*;

  /// Incus is a fork of LXD and keeps the same CLI surface.
  pub struct IncusBackend;

  impl Backend for IncusBackend {
    fn supports_vm(&self) -> bool {
      true
    }

    fn create_cmd(&self, spec: &CreateSpec) -> String {
      let vm_flag = matches!(
        spec.kind,
        engine_client::entities::instance::InstanceKind::Vm
      )
      .then_some("--vm")
      .unwrap_or_default();
      format!(
        "incus launch {} {} {vm_flag} -c limits.cpu={} -c limits.memory={}MB",
        spec.image, spec.name, spec.cpu_cores, spec.memory_mb
      )
    }

    fn start_cmd(&self, name: &str) -> String {
      format!("incus start {name}")
    }

    fn stop_cmd(&self, name: &str) -> String {
      format!("incus stop {name}")
    }

    fn restart_cmd(&self, name: &str) -> String {
      format!("incus restart {name}")
    }

    fn delete_cmd(&self, name: &str) -> String {
      format!("incus delete --force {name} 2>/dev/null || true")
    }

    fn version_cmd(&self) -> String {
      "incus version | head -n1 | awk '{print $2}'".into()
    }

    fn set_password_cmd(&self, name: &str, password: &str) -> String {
      format!(
        "incus exec {name} -- sh -c \"echo 'root:{password}' | chpasswd\""
      )
    }

    fn readiness_probe_cmd(&self, name: &str) -> String {
      format!("incus exec {name} -- echo ready")
    }

    fn api_create_request(&self, spec: &CreateSpec) -> Option<(String, serde_json::Value)> {
      Some(lxd_style_create_request(spec))
    }

    fn api_state_request(&self, name: &str, action: &str) -> Option<(String, serde_json::Value)> {
      Some(lxd_style_state_request(name, action))
    }

    fn api_delete_path(&self, name: &str) -> Option<String> {
      Some(lxd_style_delete_path(name))
    }
  }
}

pub mod proxmox {
  use super::*;

  /// Targets `pct` (containers) / `qm` (VMs); id allocation is left to
  /// `pvesh get /cluster/nextid` since Proxmox addresses guests by
  /// numeric vmid, not name — the `name` field is kept as the hostname.
  pub struct ProxmoxBackend;

  impl Backend for ProxmoxBackend {
    fn supports_vm(&self) -> bool {
      true
    }

    fn create_cmd(&self, spec: &CreateSpec) -> String {
      let vmid_capture = "VMID=$(pvesh get /cluster/nextid)";
      match spec.kind {
        engine_client::entities::instance::InstanceKind::Vm => format!(
          "{vmid_capture}; qm create $VMID --name {} --cores {} --memory {} --ostype l26; echo VMID=$VMID",
          spec.name, spec.cpu_cores, spec.memory_mb
        ),
        engine_client::entities::instance::InstanceKind::Container => format!(
          "{vmid_capture}; pct create $VMID {} --hostname {} --cores {} --memory {} --rootfs local-lvm:{}; echo VMID=$VMID",
          spec.image, spec.name, spec.cpu_cores, spec.memory_mb, spec.disk_mb / 1024
        ),
      }
    }

    fn start_cmd(&self, name: &str) -> String {
      format!("pct start {name} 2>/dev/null || qm start {name}")
    }

    fn stop_cmd(&self, name: &str) -> String {
      format!("pct stop {name} 2>/dev/null || qm stop {name}")
    }

    fn restart_cmd(&self, name: &str) -> String {
      format!(
        "pct reboot {name} 2>/dev/null || qm reboot {name}"
      )
    }

    fn delete_cmd(&self, name: &str) -> String {
      format!(
        "pct destroy {name} 2>/dev/null || qm destroy {name} 2>/dev/null || true"
      )
    }

    fn version_cmd(&self) -> String {
      "pveversion | awk -F'/' '{print $2}'".into()
    }

    fn set_password_cmd(&self, name: &str, password: &str) -> String {
      format!(
        "pct exec {name} -- sh -c \"echo 'root:{password}' | chpasswd\""
      )
    }

    fn readiness_probe_cmd(&self, name: &str) -> String {
      format!("pct exec {name} -- echo ready")
    }
  }
}
