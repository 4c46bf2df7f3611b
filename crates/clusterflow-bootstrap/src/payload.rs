//! Built-in bootstrap payloads
//!
//! One script per node role. They are uploaded over SSH and started
//! detached; the coordinator only watches for the completion signals
//! below. The main payload expects `PUBLIC_IP`, `PRIVATE_IP`, `NODE_NAME`,
//! `POD_NETWORK_CIDR` and `SSH_USER` in its environment.

use clusterflow_cloud::NodeRole;

/// Where payloads are written on the node
pub const PAYLOAD_PATH: &str = "/opt/clusterflow/bootstrap.sh";

/// Payload output on the node
pub const PAYLOAD_LOG: &str = "/tmp/clusterflow-bootstrap.log";

/// Written by every payload as its first action
pub const STARTED_MARKER: &str = "/var/lib/clusterflow/bootstrap.started";

/// Main completion signal, written by `kubeadm init`
pub const MAIN_SIGNAL: &str = "/etc/kubernetes/admin.conf";

/// Worker completion signal
pub const WORKER_SIGNAL: &str = "/var/lib/clusterflow/bootstrap.done";

/// Present once a worker has joined
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";

/// Common node preparation: kernel modules, sysctl, containerd, kubeadm
const NODE_PREPARE: &str = r#"
mkdir -p /var/lib/clusterflow
touch /var/lib/clusterflow/bootstrap.started

echo ">>> swap を無効化"
swapoff -a
sed -i '/ swap / s/^/#/' /etc/fstab

echo ">>> カーネルモジュールと sysctl"
cat <<MODULES > /etc/modules-load.d/k8s.conf
overlay
br_netfilter
MODULES
modprobe overlay
modprobe br_netfilter

cat <<SYSCTL > /etc/sysctl.d/k8s.conf
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
SYSCTL
sysctl --system

echo ">>> containerd をインストール"
apt-get update
apt-get install -y containerd apt-transport-https ca-certificates curl gpg
mkdir -p /etc/containerd
containerd config default > /etc/containerd/config.toml
sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml
systemctl restart containerd
systemctl enable containerd

echo ">>> kubeadm / kubelet / kubectl をインストール"
mkdir -p /etc/apt/keyrings
curl -fsSL https://pkgs.k8s.io/core:/stable:/v1.30/deb/Release.key \
    | gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v1.30/deb/ /' \
    > /etc/apt/sources.list.d/kubernetes.list
apt-get update
apt-get install -y kubelet kubeadm kubectl
apt-mark hold kubelet kubeadm kubectl
systemctl enable --now kubelet
"#;

/// Control plane initialization
const MAIN_INIT: &str = r#"
PRIVATE_IP="${PRIVATE_IP:-$(hostname -I | awk '{print $1}')}"

echo ">>> kubeadm init"
kubeadm init \
    --apiserver-advertise-address="${PRIVATE_IP}" \
    --apiserver-cert-extra-sans="${PUBLIC_IP}" \
    --pod-network-cidr="${POD_NETWORK_CIDR}" \
    --node-name="${NODE_NAME}"

SSH_USER="${SSH_USER:-ubuntu}"
USER_HOME="$(getent passwd "${SSH_USER}" | cut -d: -f6)"
mkdir -p "${USER_HOME}/.kube"
cp /etc/kubernetes/admin.conf "${USER_HOME}/.kube/config"
chown -R "${SSH_USER}:" "${USER_HOME}/.kube"

echo ">>> Flannel をインストール"
kubectl --kubeconfig /etc/kubernetes/admin.conf apply \
    -f https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml

echo "✅ コントロールプレーン初期化完了"
"#;

/// NVIDIA driver and container toolkit, only when a GPU is present
const GPU_SETUP: &str = r#"
if lspci | grep -qi nvidia; then
    echo ">>> NVIDIA ドライバをインストール"
    apt-get install -y ubuntu-drivers-common
    ubuntu-drivers install --gpgpu
    curl -fsSL https://nvidia.github.io/libnvidia-container/gpgkey \
        | gpg --dearmor --yes -o /usr/share/keyrings/nvidia-container-toolkit-keyring.gpg
    curl -fsSL https://nvidia.github.io/libnvidia-container/stable/deb/nvidia-container-toolkit.list \
        | sed 's#deb https://#deb [signed-by=/usr/share/keyrings/nvidia-container-toolkit-keyring.gpg] https://#g' \
        > /etc/apt/sources.list.d/nvidia-container-toolkit.list
    apt-get update
    apt-get install -y nvidia-container-toolkit
    nvidia-ctk runtime configure --runtime=containerd --set-as-default
    systemctl restart containerd
else
    echo "⚠ GPU が見つかりません。CPU ワーカーとして続行します"
fi
"#;

const WORKER_DONE: &str = r#"
touch /var/lib/clusterflow/bootstrap.done
echo "✅ ワーカー準備完了"
"#;

const HEADER: &str = "#!/bin/bash\nset -euxo pipefail\n";

/// Render the script for a role
pub fn payload_for(role: NodeRole) -> String {
    let parts: &[&str] = match role {
        NodeRole::Main => &[HEADER, NODE_PREPARE, MAIN_INIT],
        NodeRole::CpuWorker => &[HEADER, NODE_PREPARE, WORKER_DONE],
        NodeRole::GpuWorker => &[HEADER, NODE_PREPARE, GPU_SETUP, WORKER_DONE],
    };
    parts.concat()
}

/// File whose presence means the payload for `role` has finished
pub fn completion_signal(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Main => MAIN_SIGNAL,
        NodeRole::CpuWorker | NodeRole::GpuWorker => WORKER_SIGNAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_payload_uses_injected_addresses() {
        let script = payload_for(NodeRole::Main);
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("--apiserver-cert-extra-sans=\"${PUBLIC_IP}\""));
        assert!(script.contains("${POD_NETWORK_CIDR}"));
        assert!(!script.contains(WORKER_SIGNAL));
    }

    #[test]
    fn test_main_payload_copies_kubeconfig_for_ssh_user() {
        let script = payload_for(NodeRole::Main);
        assert!(script.contains("getent passwd \"${SSH_USER}\""));
        assert!(script.contains("cp /etc/kubernetes/admin.conf \"${USER_HOME}/.kube/config\""));
        assert!(!script.contains("/home/ubuntu"));
    }

    #[test]
    fn test_worker_payloads_signal_completion() {
        for role in [NodeRole::CpuWorker, NodeRole::GpuWorker] {
            let script = payload_for(role);
            assert!(script.contains(WORKER_SIGNAL));
            assert!(!script.contains("kubeadm init"));
        }
        assert!(payload_for(NodeRole::GpuWorker).contains("lspci"));
        assert!(!payload_for(NodeRole::CpuWorker).contains("nvidia"));
    }

    #[test]
    fn test_every_payload_marks_start() {
        for role in [NodeRole::Main, NodeRole::CpuWorker, NodeRole::GpuWorker] {
            assert!(payload_for(role).contains(STARTED_MARKER));
        }
    }
}
